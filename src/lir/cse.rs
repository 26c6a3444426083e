// Common-subexpression elimination at emission time. Constants and pure value operations
// are looked up by (opcode, operand handles, immediate bits); a hit answers the request
// with the earlier instruction and nothing is appended. Loads are also candidates, but
// they live in a separate table that is flushed by anything that may write memory (a
// store or a call), since every memory operation shares one access region. A label is a
// control-flow merge point, so everything remembered before it is forgotten: a value
// computed on one incoming path must not be reused on another. Stores, calls, guards,
// returns, parameters and stack allocations are never candidates. The tables live in
// the context's bump arena and are dropped with the builder's pipeline.

//! CSE filter.

use bumpalo::Bump;
use hashbrown::{DefaultHashBuilder, HashMap};

use super::writer::LirRequest;
use super::{LInsRef, LirOpcode, OpClass};

/// Identity of a pure expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CseKey {
    opcode: LirOpcode,
    operands: [Option<LInsRef>; 3],
    imm: u64,
}

type CseTable<'a> = HashMap<CseKey, LInsRef, DefaultHashBuilder, &'a Bump>;

pub struct CseFilter<'a> {
    pure: CseTable<'a>,
    loads: CseTable<'a>,
    hits: usize,
}

impl<'a> CseFilter<'a> {
    pub fn new_in(arena: &'a Bump) -> Self {
        Self {
            pure: HashMap::new_in(arena),
            loads: HashMap::new_in(arena),
            hits: 0,
        }
    }

    /// Drop remembered values that `req` invalidates.
    pub fn observe(&mut self, req: &LirRequest) {
        match req.opcode.info().class {
            OpClass::Marker if req.opcode == LirOpcode::Label => {
                log::trace!("cse: label, clearing {} entries", self.pure.len() + self.loads.len());
                self.pure.clear();
                self.loads.clear();
            }
            OpClass::Store | OpClass::Call => self.loads.clear(),
            _ => {}
        }
    }

    /// Key for a request, or `None` when it must always be emitted.
    pub fn key_for(&self, req: &LirRequest) -> Option<CseKey> {
        match req.opcode.info().class {
            OpClass::Const | OpClass::Pure | OpClass::Load => Some(CseKey {
                opcode: req.opcode,
                operands: req.operands,
                imm: req.imm.key_bits(),
            }),
            _ => None,
        }
    }

    pub fn find(&mut self, key: &CseKey) -> Option<LInsRef> {
        let hit = self.table(key).get(key).copied();
        if let Some(r) = hit {
            self.hits += 1;
            log::trace!("cse: {} reused as {}", key.opcode, r);
        }
        hit
    }

    pub fn insert(&mut self, key: CseKey, r: LInsRef) {
        if key.opcode.info().class == OpClass::Load {
            self.loads.insert(key, r);
        } else {
            self.pure.insert(key, r);
        }
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    fn table(&self, key: &CseKey) -> &CseTable<'a> {
        if key.opcode.info().class == OpClass::Load {
            &self.loads
        } else {
            &self.pure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Immediate, ACC_OTHER};

    fn key(filter: &CseFilter<'_>, req: &LirRequest) -> CseKey {
        filter.key_for(req).unwrap()
    }

    #[test]
    fn test_side_effects_are_not_candidates() {
        let arena = Bump::new();
        let filter = CseFilter::new_in(&arena);
        let p = LInsRef::from_index(1);
        let disp = Immediate::Disp { offset: 0, acc: ACC_OTHER };
        let store = LirRequest::new(LirOpcode::StI).with_operands(&[p, p]).with_imm(disp);
        assert!(filter.key_for(&store).is_none());
        assert!(filter.key_for(&LirRequest::new(LirOpcode::CallV)).is_none());
        assert!(filter.key_for(&LirRequest::new(LirOpcode::X)).is_none());
        assert!(filter.key_for(&LirRequest::new(LirOpcode::Alloc).with_imm(Immediate::Size(8))).is_none());
    }

    #[test]
    fn test_float_constants_keep_signed_zero_apart() {
        let arena = Bump::new();
        let mut filter = CseFilter::new_in(&arena);
        let pos = key(&filter, &LirRequest::imm_double(0.0));
        let neg = key(&filter, &LirRequest::imm_double(-0.0));
        filter.insert(pos, LInsRef::from_index(1));
        assert_eq!(filter.find(&neg), None);
        assert_eq!(filter.find(&pos), Some(LInsRef::from_index(1)));
    }

    #[test]
    fn test_store_flushes_loads_only() {
        let arena = Bump::new();
        let mut filter = CseFilter::new_in(&arena);
        let base = LInsRef::from_index(1);
        let disp = Immediate::Disp { offset: 8, acc: ACC_OTHER };
        let load = LirRequest::new(LirOpcode::LdI).with_operands(&[base]).with_imm(disp);
        let load_key = key(&filter, &load);
        let const_key = key(&filter, &LirRequest::imm_int(4));
        filter.insert(load_key, LInsRef::from_index(2));
        filter.insert(const_key, LInsRef::from_index(3));

        filter.observe(
            &LirRequest::new(LirOpcode::StI)
                .with_operands(&[LInsRef::from_index(3), base])
                .with_imm(disp),
        );
        assert_eq!(filter.find(&load_key), None);
        assert_eq!(filter.find(&const_key), Some(LInsRef::from_index(3)));

        filter.observe(&LirRequest::new(LirOpcode::Label));
        assert_eq!(filter.find(&const_key), None);
        assert_eq!(filter.hits(), 1);
    }
}
