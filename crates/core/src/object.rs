//! Heap object kinds (§3 "Object") and the `ObjRef` handle used to reach them.
//!
//! Every object lives behind a [`GcBox`] that carries the mark bit and the
//! intrusive `next` pointer required by [`crate::heap::Heap`]'s all-objects
//! list (§3 Invariants: "every heap object is reachable from `vm.objects`
//! until freed"). `ObjRef` is a thin, `Copy` handle over a raw pointer to a
//! `GcBox` — the object graph is a web of aliased, mutually-referencing
//! objects (closures capturing upvalues, classes holding bound methods,
//! instances pointing back at their class), which is exactly the shape Rust's
//! ownership model fights; a small admitted `unsafe` surface here is the
//! idiomatic escape hatch the same way a tracing GC's object graph always is.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

/// The GC header every heap object carries, plus the object's own payload.
pub(crate) struct GcBox {
    pub(crate) marked: Cell<bool>,
    /// Link in the heap's intrusive all-objects list (§3 Object invariants).
    pub(crate) next: Cell<Option<ObjRef>>,
    pub(crate) obj: Obj,
}

/// A `Copy` handle to a heap-allocated, GC-managed object.
///
/// Two `ObjRef`s are equal iff they point at the same `GcBox`: reference
/// identity for every object kind, which for interned strings is equivalent
/// to content equality (§3 "Value").
#[derive(Clone, Copy)]
pub struct ObjRef(NonNull<GcBox>);

impl ObjRef {
    pub(crate) fn from_box(ptr: NonNull<GcBox>) -> Self {
        ObjRef(ptr)
    }

    pub(crate) fn as_box_ptr(self) -> NonNull<GcBox> {
        self.0
    }

    /// Round-trips this reference through a raw integer, for the NaN-boxed
    /// `Value` representation to stash in a pointer-sized payload.
    #[cfg(feature = "nan-boxing")]
    pub(crate) fn to_bits(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// `bits` must have come from `ObjRef::to_bits` on a reference whose
    /// `GcBox` has not since been freed by a collection's sweep phase.
    #[cfg(feature = "nan-boxing")]
    pub(crate) unsafe fn from_bits(bits: usize) -> Self {
        ObjRef(NonNull::new(bits as *mut GcBox).expect("internal: NaN-boxed object bits were 0"))
    }

    pub fn get(self) -> &'static Obj {
        // SAFETY: a GcBox is only ever freed by the sweep phase of a
        // collection, and sweep only frees boxes that marking proved
        // unreachable from every live root. Any `ObjRef` a caller holds was
        // itself reached from a root, so the box it points at is still live
        // for the duration the caller can observe.
        unsafe { &self.0.as_ref().obj }
    }

    pub(crate) fn is_marked(self) -> bool {
        unsafe { self.0.as_ref().marked.get() }
    }

    pub(crate) fn set_marked(self, marked: bool) {
        unsafe { self.0.as_ref().marked.set(marked) };
    }

    pub(crate) fn next(self) -> Option<ObjRef> {
        unsafe { self.0.as_ref().next.get() }
    }

    pub(crate) fn set_next(self, next: Option<ObjRef>) {
        unsafe { self.0.as_ref().next.set(next) };
    }

    pub fn as_string(self) -> Option<&'static ObjString> {
        match self.get() {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(self) -> Option<&'static ObjFunction> {
        match self.get() {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(self) -> Option<&'static ObjClosure> {
        match self.get() {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_upvalue(self) -> Option<&'static ObjUpvalue> {
        match self.get() {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_class(self) -> Option<&'static ObjClass> {
        match self.get() {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(self) -> Option<&'static ObjInstance> {
        match self.get() {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(self) -> Option<&'static ObjBoundMethod> {
        match self.get() {
            Obj::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native(self) -> Option<&'static ObjNative> {
        match self.get() {
            Obj::Native(n) => Some(n),
            _ => None,
        }
    }

    /// The type name used in runtime error messages ("can only call
    /// functions and classes", property-access diagnostics, etc).
    pub fn kind_name(self) -> &'static str {
        match self.get() {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ObjRef {}

impl std::hash::Hash for ObjRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_ptr().hash(state);
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p}: {})", self.0.as_ptr(), self.kind_name())
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Obj::String(s) => write!(f, "{}", s.as_str()),
            Obj::Function(fun) => match fun.name {
                Some(name) => write!(f, "<fn {}>", name.as_string().unwrap().as_str()),
                None => write!(f, "<script>"),
            },
            Obj::Native(n) => write!(f, "<native fn {}>", n.name.as_string().unwrap().as_str()),
            Obj::Closure(c) => fmt::Display::fmt(&c.function, f),
            Obj::Upvalue(_) => write!(f, "<upvalue>"),
            Obj::Class(c) => write!(f, "{}", c.name.as_string().unwrap().as_str()),
            Obj::Instance(i) => {
                let name = i
                    .class
                    .as_class()
                    .and_then(ObjClass::as_string_name)
                    .unwrap_or("<class>");
                write!(f, "{} instance", name)
            }
            Obj::BoundMethod(b) => fmt::Display::fmt(&b.method, f),
        }
    }
}

/// The tagged variant of every heap object kind (§3 "Object").
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// An immutable, content-interned byte sequence plus its precomputed hash.
pub struct ObjString {
    bytes: Box<str>,
    hash: u32,
}

impl ObjString {
    pub(crate) fn new(bytes: Box<str>) -> Self {
        let hash = fnv1a_hash(bytes.as_bytes());
        ObjString { bytes, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// FNV-1a, 32-bit, over raw bytes (§3 "String").
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled function: arity, the upvalues it captures, its own bytecode.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    pub fn name_str(&self) -> &str {
        match self.name {
            Some(r) => r.as_string().expect("function name is a string").as_str(),
            None => "script",
        }
    }
}

/// A host function: `(argc, argv) -> Value` (§6 "Native interface"),
/// expressed idiomatically as a function pointer over a slice.
pub type NativeFn = fn(args: &[Value]) -> Value;

pub struct ObjNative {
    pub name: ObjRef,
    pub function: NativeFn,
}

/// A function paired with the upvalues it captured at creation time.
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

impl fmt::Display for ObjClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.function, f)
    }
}

/// A captured variable: open while it still lives on the VM's value stack,
/// closed once its owning frame has returned (§3 "Upvalue").
#[derive(Clone, Copy)]
pub enum Upvalue {
    Open(usize),
    Closed,
}

pub struct ObjUpvalue {
    state: Cell<Upvalue>,
    closed_value: Cell<Value>,
    /// Link in the VM's open-upvalues list, strictly descending by the
    /// stack address each open upvalue points at (§3 Invariants).
    pub(crate) open_next: Cell<Option<ObjRef>>,
}

impl ObjUpvalue {
    pub(crate) fn new_open(stack_index: usize) -> Self {
        ObjUpvalue {
            state: Cell::new(Upvalue::Open(stack_index)),
            closed_value: Cell::new(Value::nil()),
            open_next: Cell::new(None),
        }
    }

    pub fn state(&self) -> Upvalue {
        self.state.get()
    }

    pub fn stack_index(&self) -> Option<usize> {
        match self.state.get() {
            Upvalue::Open(i) => Some(i),
            Upvalue::Closed => None,
        }
    }

    pub fn get_closed(&self) -> Value {
        self.closed_value.get()
    }

    pub fn set_closed(&self, value: Value) {
        self.closed_value.set(value);
    }

    pub fn close(&self, value: Value) {
        self.closed_value.set(value);
        self.state.set(Upvalue::Closed);
    }

    pub fn open_next(&self) -> Option<ObjRef> {
        self.open_next.get()
    }

    pub fn set_open_next(&self, next: Option<ObjRef>) {
        self.open_next.set(next);
    }
}

/// A class: a name and a method table (§3 "Class").
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: RefCell<Table>,
}

impl ObjClass {
    fn as_string_name(&self) -> Option<&str> {
        self.name.as_string().map(ObjString::as_str)
    }
}

/// An instance of a class: a back-reference plus its own field table
/// (§3 "Instance"; §9 "field table may shadow a method of the same name").
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: RefCell<Table>,
}

/// A closure bound to the receiver `this` refers to inside it
/// (§3 "BoundMethod"; Glossary "Bound method").
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_known_vector() {
        // FNV-1a 32-bit of the empty string is the offset basis.
        assert_eq!(fnv1a_hash(b""), 2166136261);
        // Two equal byte sequences hash identically.
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
        assert_ne!(fnv1a_hash(b"hello"), fnv1a_hash(b"world"));
    }
}
