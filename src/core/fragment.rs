// This module holds what a successful finalize leaves behind. EntryPoint is the address of
// generated code inside the context's executable memory. Callable tags it with the kind of
// value the code returns (nothing, a 32-bit integer, a 64-bit integer or a double); the tag
// is decided once from the builder's return-kind accumulator and never changes afterwards.
// ReturnKinds is that accumulator: one bit per return instruction kind seen while building.
// Fragment is the published record (name, callable, the [start, guard] view into the shared
// LIR buffer, code size and the tracer output), and FragmentTable maps names to fragments
// with last-writer-wins semantics. Entry points stay valid until the owning context is
// dropped, even after a newer fragment has replaced theirs in the table.

//! Compiled fragments and the fragment table.

use std::fmt;
use std::ptr::NonNull;

use hashbrown::HashMap;

use crate::lir::LInsRef;

/// Start of a compiled fragment's machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint(NonNull<u8>);

impl EntryPoint {
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }

    /// Reinterpret the entry point as a function pointer type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "C"` function pointer whose signature matches the
    /// parameters and return kind the fragment was built with, and the owning
    /// context must still be alive whenever the result is called.
    pub unsafe fn cast<F: Copy>(self) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const u8>(),
            "entry points can only be cast to function pointers"
        );
        let ptr = self.0.as_ptr() as *const u8;
        std::mem::transmute_copy(&ptr)
    }
}

/// Kind of value a fragment returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    Int,
    Quad,
    Double,
    Void,
}

impl ReturnKind {
    const ALL: [ReturnKind; 4] = [ReturnKind::Int, ReturnKind::Quad, ReturnKind::Double, ReturnKind::Void];

    const fn bit(self) -> u8 {
        match self {
            ReturnKind::Int => 1,
            ReturnKind::Quad => 2,
            ReturnKind::Double => 4,
            ReturnKind::Void => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ReturnKind::Int => "int",
            ReturnKind::Quad => "quad",
            ReturnKind::Double => "double",
            ReturnKind::Void => "void",
        }
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of return kinds seen while building a fragment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReturnKinds(u8);

impl ReturnKinds {
    pub fn insert(&mut self, kind: ReturnKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: ReturnKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The only kind in the set, if there is exactly one.
    pub fn single(self) -> Option<ReturnKind> {
        if self.len() == 1 {
            self.iter().next()
        } else {
            None
        }
    }

    pub fn iter(self) -> impl Iterator<Item = ReturnKind> {
        ReturnKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl fmt::Display for ReturnKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        for (i, kind) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", kind)?;
        }
        Ok(())
    }
}

/// Entry point tagged with the kind of value it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callable {
    Void(EntryPoint),
    Int(EntryPoint),
    Quad(EntryPoint),
    Double(EntryPoint),
}

impl Callable {
    pub fn new(kind: ReturnKind, entry: EntryPoint) -> Self {
        match kind {
            ReturnKind::Void => Callable::Void(entry),
            ReturnKind::Int => Callable::Int(entry),
            ReturnKind::Quad => Callable::Quad(entry),
            ReturnKind::Double => Callable::Double(entry),
        }
    }

    pub fn entry(self) -> EntryPoint {
        match self {
            Callable::Void(e) | Callable::Int(e) | Callable::Quad(e) | Callable::Double(e) => e,
        }
    }

    pub fn kind(self) -> ReturnKind {
        match self {
            Callable::Void(_) => ReturnKind::Void,
            Callable::Int(_) => ReturnKind::Int,
            Callable::Quad(_) => ReturnKind::Quad,
            Callable::Double(_) => ReturnKind::Double,
        }
    }

    /// Call a fragment that takes no parameters and returns an int.
    ///
    /// # Safety
    ///
    /// The fragment must take no parameters and the owning context must be alive.
    pub unsafe fn call_int(self) -> Option<i32> {
        match self {
            Callable::Int(e) => Some(e.cast::<unsafe extern "C" fn() -> i32>()()),
            _ => None,
        }
    }

    /// # Safety
    ///
    /// Same as [`Callable::call_int`].
    pub unsafe fn call_quad(self) -> Option<i64> {
        match self {
            Callable::Quad(e) => Some(e.cast::<unsafe extern "C" fn() -> i64>()()),
            _ => None,
        }
    }

    /// # Safety
    ///
    /// Same as [`Callable::call_int`].
    pub unsafe fn call_double(self) -> Option<f64> {
        match self {
            Callable::Double(e) => Some(e.cast::<unsafe extern "C" fn() -> f64>()()),
            _ => None,
        }
    }
}

/// A compiled, published fragment.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub name: String,
    pub callable: Callable,
    /// The fragment's `start` instruction.
    pub first_ins: LInsRef,
    /// The terminating guard appended by finalize.
    pub last_ins: LInsRef,
    pub code_size: usize,
    /// Tracer output, empty unless the context is verbose.
    pub trace: Vec<String>,
}

impl Fragment {
    pub fn entry(&self) -> EntryPoint {
        self.callable.entry()
    }

    pub fn return_kind(&self) -> ReturnKind {
        self.callable.kind()
    }
}

/// Name to fragment map. Publishing a name again replaces the old record.
#[derive(Debug, Default)]
pub struct FragmentTable {
    by_name: HashMap<String, Fragment>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `fragment`, returning the record it replaced.
    pub fn publish(&mut self, fragment: Fragment) -> Option<Fragment> {
        self.by_name.insert(fragment.name.clone(), fragment)
    }

    pub fn get(&self, name: &str) -> Option<&Fragment> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_name.keys().map(|k| k.as_str())
    }

    pub(crate) fn clear(&mut self) {
        self.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_kinds_accumulator() {
        let mut kinds = ReturnKinds::default();
        assert!(kinds.is_empty());
        assert_eq!(kinds.single(), None);

        kinds.insert(ReturnKind::Int);
        kinds.insert(ReturnKind::Int);
        assert_eq!(kinds.single(), Some(ReturnKind::Int));

        kinds.insert(ReturnKind::Double);
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds.single(), None);
        assert_eq!(kinds.to_string(), "int, double");
    }

    #[test]
    fn test_table_last_writer_wins() {
        let mut table = FragmentTable::new();
        let mut byte = 0u8;
        let entry = EntryPoint::new(NonNull::from(&mut byte));
        let fragment = |size| Fragment {
            name: "f".to_string(),
            callable: Callable::new(ReturnKind::Int, entry),
            first_ins: LInsRef::from_index(0),
            last_ins: LInsRef::from_index(1),
            code_size: size,
            trace: Vec::new(),
        };

        assert!(table.publish(fragment(10)).is_none());
        let replaced = table.publish(fragment(20));
        assert_eq!(replaced.map(|f| f.code_size), Some(10));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("f").map(|f| f.code_size), Some(20));
        assert_eq!(table.get("f").map(|f| f.return_kind()), Some(ReturnKind::Int));
    }
}
