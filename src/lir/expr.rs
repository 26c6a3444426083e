// Peephole expression simplifier. It only looks at the request being emitted and the
// instructions its operands point to: constant operands are folded, algebraic identities
// on integers collapse to an existing operand or a new constant, a select with a known
// condition or identical arms collapses to one arm, and conditional branches and guards
// with a known condition become unconditional. Float identities are left alone because
// x + 0.0, x * 1.0 and friends are not exact under IEEE 754 (signed zero, NaN payloads),
// but fully constant float arithmetic is folded. Folded integer arithmetic wraps and
// shift counts are masked to the operand width, which matches what the x86-64 backend
// does at run time.

//! Expression filter.

use super::writer::LirRequest;
use super::{LInsRef, LirBuffer, LirOpcode};

/// Outcome of simplifying one request.
#[derive(Debug, PartialEq)]
pub enum Simplified {
    /// Answer with an instruction that is already in the buffer.
    Existing(LInsRef),
    /// Continue down the pipeline with this (possibly rewritten) request.
    Request(LirRequest),
}

#[derive(Debug, Default)]
pub struct ExprFilter {
    folds: usize,
}

/// Constant value of an operand.
#[derive(Debug, Clone, Copy)]
enum Const {
    Int(i32),
    Quad(i64),
    Float(f32),
    Double(f64),
}

fn constant(buf: &LirBuffer, r: Option<LInsRef>) -> Option<Const> {
    let ins = buf.ins(r?);
    ins.int_const()
        .map(Const::Int)
        .or_else(|| ins.quad_const().map(Const::Quad))
        .or_else(|| ins.float_const().map(Const::Float))
        .or_else(|| ins.double_const().map(Const::Double))
}

fn bool_int(b: bool) -> LirRequest {
    LirRequest::imm_int(b as i32)
}

/// x86 `cvttsd2si` semantics: NaN and out-of-range inputs give the
/// integer indefinite value.
fn d2i(v: f64) -> i32 {
    if v.is_nan() || v >= 2147483648.0 || v < -2147483648.0 {
        i32::MIN
    } else {
        v as i32
    }
}

impl ExprFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn folds(&self) -> usize {
        self.folds
    }

    pub fn simplify(&mut self, buf: &LirBuffer, req: LirRequest) -> Simplified {
        let opcode = req.opcode;
        let result = self
            .fold(buf, &req)
            .map(Simplified::Request)
            .or_else(|| self.identity(buf, &req))
            .or_else(|| self.control(buf, &req).map(Simplified::Request));
        match result {
            Some(simplified) => {
                self.folds += 1;
                log::trace!("expr: simplified {} to {:?}", opcode, simplified);
                simplified
            }
            None => Simplified::Request(req),
        }
    }

    /// Fold operations whose operands are all constants.
    fn fold(&self, buf: &LirBuffer, req: &LirRequest) -> Option<LirRequest> {
        use LirOpcode::*;
        let a = constant(buf, req.operand(0));
        let b = constant(buf, req.operand(1));

        if let (Some(Const::Int(x)), Some(Const::Int(y))) = (a, b) {
            let v = match req.opcode {
                AddI => x.wrapping_add(y),
                SubI => x.wrapping_sub(y),
                MulI => x.wrapping_mul(y),
                AndI => x & y,
                OrI => x | y,
                XorI => x ^ y,
                LshI => x.wrapping_shl(y as u32),
                RshI => x.wrapping_shr(y as u32),
                RshuI => (x as u32).wrapping_shr(y as u32) as i32,
                EqI => (x == y) as i32,
                LtI => (x < y) as i32,
                GtI => (x > y) as i32,
                LeI => (x <= y) as i32,
                GeI => (x >= y) as i32,
                _ => return None,
            };
            return Some(LirRequest::imm_int(v));
        }

        if let (Some(Const::Quad(x)), Some(Const::Quad(y))) = (a, b) {
            let v = match req.opcode {
                AddQ => x.wrapping_add(y),
                SubQ => x.wrapping_sub(y),
                MulQ => x.wrapping_mul(y),
                AndQ => x & y,
                OrQ => x | y,
                XorQ => x ^ y,
                EqQ => return Some(bool_int(x == y)),
                LtQ => return Some(bool_int(x < y)),
                GtQ => return Some(bool_int(x > y)),
                LeQ => return Some(bool_int(x <= y)),
                GeQ => return Some(bool_int(x >= y)),
                _ => return None,
            };
            return Some(LirRequest::imm_quad(v));
        }

        if let (Some(Const::Quad(x)), Some(Const::Int(y))) = (a, b) {
            let v = match req.opcode {
                LshQ => x.wrapping_shl(y as u32),
                RshQ => x.wrapping_shr(y as u32),
                RshuQ => (x as u64).wrapping_shr(y as u32) as i64,
                _ => return None,
            };
            return Some(LirRequest::imm_quad(v));
        }

        if let (Some(Const::Float(x)), Some(Const::Float(y))) = (a, b) {
            let v = match req.opcode {
                AddF => x + y,
                SubF => x - y,
                MulF => x * y,
                DivF => x / y,
                EqF => return Some(bool_int(x == y)),
                LtF => return Some(bool_int(x < y)),
                GtF => return Some(bool_int(x > y)),
                LeF => return Some(bool_int(x <= y)),
                GeF => return Some(bool_int(x >= y)),
                _ => return None,
            };
            return Some(LirRequest::imm_float(v));
        }

        if let (Some(Const::Double(x)), Some(Const::Double(y))) = (a, b) {
            let v = match req.opcode {
                AddD => x + y,
                SubD => x - y,
                MulD => x * y,
                DivD => x / y,
                EqD => return Some(bool_int(x == y)),
                LtD => return Some(bool_int(x < y)),
                GtD => return Some(bool_int(x > y)),
                LeD => return Some(bool_int(x <= y)),
                GeD => return Some(bool_int(x >= y)),
                _ => return None,
            };
            return Some(LirRequest::imm_double(v));
        }

        // Conversions.
        match (req.opcode, a) {
            (Q2I, Some(Const::Quad(x))) => Some(LirRequest::imm_int(x as i32)),
            (I2Q, Some(Const::Int(x))) => Some(LirRequest::imm_quad(x as i64)),
            (UI2UQ, Some(Const::Int(x))) => Some(LirRequest::imm_quad(x as u32 as i64)),
            (I2D, Some(Const::Int(x))) => Some(LirRequest::imm_double(x as f64)),
            (D2I, Some(Const::Double(x))) => Some(LirRequest::imm_int(d2i(x))),
            (F2D, Some(Const::Float(x))) => Some(LirRequest::imm_double(x as f64)),
            (D2F, Some(Const::Double(x))) => Some(LirRequest::imm_float(x as f32)),
            _ => None,
        }
    }

    /// Integer identities and selects.
    fn identity(&self, buf: &LirBuffer, req: &LirRequest) -> Option<Simplified> {
        use LirOpcode::*;
        use Simplified::Existing;

        if matches!(req.opcode, CmovI | CmovQ) {
            let (cond, t, f) = (req.operand(0)?, req.operand(1)?, req.operand(2)?);
            if t == f {
                return Some(Existing(t));
            }
            return match constant(buf, Some(cond)) {
                Some(Const::Int(0)) => Some(Existing(f)),
                Some(Const::Int(_)) => Some(Existing(t)),
                _ => None,
            };
        }

        let x = req.operand(0)?;
        let y = req.operand(1)?;
        let quad = matches!(
            req.opcode,
            AddQ | SubQ | MulQ | AndQ | OrQ | XorQ | LshQ | RshQ | RshuQ | EqQ | LtQ | GtQ | LeQ | GeQ
        );
        let zero = || {
            if quad {
                LirRequest::imm_quad(0)
            } else {
                LirRequest::imm_int(0)
            }
        };

        if x == y {
            return match req.opcode {
                AndI | OrI | AndQ | OrQ => Some(Existing(x)),
                SubI | XorI | SubQ | XorQ => Some(Simplified::Request(zero())),
                EqI | LeI | GeI | EqQ | LeQ | GeQ => Some(Simplified::Request(bool_int(true))),
                LtI | GtI | LtQ | GtQ => Some(Simplified::Request(bool_int(false))),
                _ => None,
            };
        }

        // Integer constant on the right, or on the left for commutative ops.
        let as_i64 = |c: Option<Const>| match c {
            Some(Const::Int(v)) => Some(v as i64),
            Some(Const::Quad(v)) => Some(v),
            _ => None,
        };
        let commutative = matches!(req.opcode, AddI | MulI | AndI | OrI | XorI | AddQ | MulQ | AndQ | OrQ | XorQ);
        let (value, k, k_ref) = match (as_i64(constant(buf, Some(x))), as_i64(constant(buf, Some(y)))) {
            (_, Some(k)) => (x, k, y),
            (Some(k), None) if commutative => (y, k, x),
            _ => return None,
        };

        match (req.opcode, k) {
            (AddI | SubI | OrI | XorI | AddQ | SubQ | OrQ | XorQ, 0) => Some(Existing(value)),
            (LshI | RshI | RshuI | LshQ | RshQ | RshuQ, 0) => Some(Existing(value)),
            (MulI | MulQ, 1) => Some(Existing(value)),
            (MulI | MulQ | AndI | AndQ, 0) => Some(Existing(k_ref)),
            (AndI | AndQ, -1) => Some(Existing(value)),
            (OrI | OrQ, -1) => Some(Existing(k_ref)),
            _ => None,
        }
    }

    /// Branches and guards whose condition is known.
    fn control(&self, buf: &LirBuffer, req: &LirRequest) -> Option<LirRequest> {
        use LirOpcode::*;
        let Some(Const::Int(c)) = constant(buf, req.operand(0)) else {
            return None;
        };
        let always = match req.opcode {
            JT | XT => c != 0,
            JF | XF => c == 0,
            _ => return None,
        };
        if !always {
            return None;
        }
        let opcode = if matches!(req.opcode, JT | JF) { J } else { X };
        Some(LirRequest::new(opcode).with_target(req.target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (LirBuffer, LInsRef) {
        let mut buf = LirBuffer::new();
        buf.append(LirRequest::new(LirOpcode::Start));
        let p = buf.append(
            LirRequest::new(LirOpcode::Param)
                .with_imm(crate::lir::Immediate::Param { index: 0, kind: crate::lir::ValueKind::I32 }),
        );
        (buf, p)
    }

    fn request(op: LirOpcode, operands: &[LInsRef]) -> LirRequest {
        LirRequest::new(op).with_operands(operands)
    }

    #[test]
    fn test_constant_folding_wraps_and_masks() {
        let (mut buf, _) = setup();
        let max = buf.append(LirRequest::imm_int(i32::MAX));
        let one = buf.append(LirRequest::imm_int(1));
        let big = buf.append(LirRequest::imm_int(33));
        let mut expr = ExprFilter::new();

        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::AddI, &[max, one])),
            Simplified::Request(LirRequest::imm_int(i32::MIN))
        );
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::LshI, &[one, big])),
            Simplified::Request(LirRequest::imm_int(2))
        );
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::LtI, &[one, max])),
            Simplified::Request(LirRequest::imm_int(1))
        );
        assert_eq!(expr.folds(), 3);
    }

    #[test]
    fn test_d2i_out_of_range() {
        assert_eq!(d2i(f64::NAN), i32::MIN);
        assert_eq!(d2i(1e10), i32::MIN);
        assert_eq!(d2i(-3.9), -3);
    }

    #[test]
    fn test_identities() {
        let (mut buf, p) = setup();
        let zero = buf.append(LirRequest::imm_int(0));
        let one = buf.append(LirRequest::imm_int(1));
        let ones = buf.append(LirRequest::imm_int(-1));
        let mut expr = ExprFilter::new();

        assert_eq!(expr.simplify(&buf, request(LirOpcode::AddI, &[p, zero])), Simplified::Existing(p));
        assert_eq!(expr.simplify(&buf, request(LirOpcode::AddI, &[zero, p])), Simplified::Existing(p));
        assert_eq!(expr.simplify(&buf, request(LirOpcode::MulI, &[one, p])), Simplified::Existing(p));
        assert_eq!(expr.simplify(&buf, request(LirOpcode::MulI, &[p, zero])), Simplified::Existing(zero));
        assert_eq!(expr.simplify(&buf, request(LirOpcode::OrI, &[p, ones])), Simplified::Existing(ones));
        assert_eq!(expr.simplify(&buf, request(LirOpcode::AndI, &[p, p])), Simplified::Existing(p));
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::SubI, &[p, p])),
            Simplified::Request(LirRequest::imm_int(0))
        );
        // Subtraction is not commutative.
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::SubI, &[zero, p])),
            Simplified::Request(request(LirOpcode::SubI, &[zero, p]))
        );
    }

    #[test]
    fn test_cmov_and_guards() {
        let (mut buf, p) = setup();
        let zero = buf.append(LirRequest::imm_int(0));
        let one = buf.append(LirRequest::imm_int(1));
        let mut expr = ExprFilter::new();

        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::CmovI, &[zero, p, one])),
            Simplified::Existing(one)
        );
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::CmovI, &[p, one, one])),
            Simplified::Existing(one)
        );
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::XT, &[one])),
            Simplified::Request(LirRequest::new(LirOpcode::X))
        );
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::JF, &[zero])),
            Simplified::Request(LirRequest::new(LirOpcode::J))
        );
        // A never-taken branch stays as it is.
        assert_eq!(
            expr.simplify(&buf, request(LirOpcode::JT, &[zero])),
            Simplified::Request(request(LirOpcode::JT, &[zero]))
        );
    }
}
