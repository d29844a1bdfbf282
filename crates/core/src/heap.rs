//! The object heap (§2 "Object heap & interning", §3 "Lifecycle").
//!
//! `Heap` owns every object the interpreter ever allocates through an
//! intrusive singly-linked list (§3 Invariants: "every heap object is
//! reachable from `vm.objects` until freed"), owns the string intern table,
//! and tracks the allocation-pressure counters ([`Heap::bytes_allocated`],
//! [`Heap::next_gc`]) that drive collection (§4.H "Trigger").
//!
//! Every routine that allocates more than one object and must keep earlier
//! ones alive while building a later one (§4.H "Allocation safety") pushes
//! the in-progress values onto [`Heap::push_root`]'s temporary root stack
//! first. This stands in for the C implementation's trick of pushing onto
//! the VM's own value stack — here it is a dedicated stack so the compiler,
//! which has no VM stack of its own, gets the same guarantee.

use crate::object::{
    GcBox, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjRef, ObjString,
    ObjUpvalue,
};
use crate::table::Table;
use crate::value::Value;
use std::cell::RefCell;
use std::mem::size_of;
use std::ptr::NonNull;

/// Initial collection threshold (§4.H "initially ~1 MiB").
pub const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    head: Option<ObjRef>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    /// Transient GC roots for values under construction that are not yet
    /// reachable from any permanent root (§4.H "Allocation safety").
    temp_roots: Vec<Value>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            head: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            temp_roots: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn set_next_gc(&mut self, threshold: usize) {
        self.next_gc = threshold;
    }

    /// §4.H "Trigger": "When `new_size > old_size`, if `bytesAllocated >
    /// nextGC`... a collection runs." Every allocation in this module goes
    /// through `alloc`, so checking this after each one reproduces the rule.
    pub fn should_collect(&self, stress: bool) -> bool {
        stress || self.bytes_allocated > self.next_gc
    }

    /// §4.H step 5: "`nextGC = bytesAllocated * 2`."
    pub fn update_next_gc(&mut self) {
        self.next_gc = self.bytes_allocated * 2;
    }

    /// Keeps `value` reachable for the duration between its creation and the
    /// moment it is linked into something durable (§4.H "Allocation safety").
    pub fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    pub(crate) fn temp_roots(&self) -> &[Value] {
        &self.temp_roots
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += Heap::estimate_size(&obj);
        let boxed = Box::new(GcBox {
            marked: std::cell::Cell::new(false),
            next: std::cell::Cell::new(self.head),
            obj,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        let r = ObjRef::from_box(ptr);
        self.head = Some(r);
        r
    }

    /// Approximates the size of an object's own payload, on top of the
    /// shared `GcBox` header every object carries. Used only to drive the
    /// allocation-pressure heuristic of §4.H, not as an exact memory report.
    fn estimate_size(obj: &Obj) -> usize {
        let header = size_of::<GcBox>();
        header
            + match obj {
                Obj::String(s) => s.as_str().len(),
                Obj::Function(f) => size_of::<ObjFunction>() + f.chunk.approx_size(),
                Obj::Native(_) => size_of::<crate::object::ObjNative>(),
                Obj::Closure(c) => size_of::<ObjClosure>() + c.upvalues.len() * size_of::<ObjRef>(),
                Obj::Upvalue(_) => size_of::<ObjUpvalue>(),
                Obj::Class(_) => size_of::<ObjClass>(),
                Obj::Instance(_) => size_of::<ObjInstance>(),
                Obj::BoundMethod(_) => size_of::<ObjBoundMethod>(),
            }
    }

    /// Accounts for growth of a `Chunk` that is not (yet) wrapped in an
    /// `ObjFunction` — i.e. the in-progress chunk a `FunctionCompiler` is
    /// still writing into. Mirrors §5's `reallocate(ptr, old, new)` being
    /// the single primitive all dynamic arrays grow through.
    pub fn track_bytes_delta(&mut self, delta: i64) {
        if delta >= 0 {
            self.bytes_allocated += delta as usize;
        } else {
            self.bytes_allocated = self.bytes_allocated.saturating_sub((-delta) as usize);
        }
    }

    /// Head of the intrusive all-objects list, for the sweep phase to walk.
    pub(crate) fn objects_head(&self) -> Option<ObjRef> {
        self.head
    }

    pub(crate) fn set_objects_head(&mut self, head: Option<ObjRef>) {
        self.head = head;
    }

    pub(crate) fn free_object(&mut self, r: ObjRef) {
        let size = Heap::estimate_size(r.get());
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        // SAFETY: called only from sweep, which only reaches objects that
        // marking proved unreachable from every live root, and each object
        // is swept at most once per cycle.
        unsafe {
            drop(Box::from_raw(r.as_box_ptr().as_ptr()));
        }
    }

    pub(crate) fn strings_table(&mut self) -> &mut Table {
        &mut self.strings
    }

    /// Content-interns `s`: returns the existing `ObjRef` if an equal string
    /// is already interned, else allocates and registers a new one (§3
    /// "String... content-interned globally").
    pub fn intern(&mut self, s: &str) -> ObjRef {
        let hash = crate::object::fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s.as_bytes(), hash) {
            return existing;
        }
        let obj = self.alloc(Obj::String(ObjString::new(s.into())));
        self.push_root(Value::obj(obj));
        self.strings.set(obj, Value::nil());
        self.pop_root();
        obj
    }

    /// Concatenation goes through the same interning path: two equal
    /// concatenation results are the same object (§8 scenario 2).
    pub fn intern_owned(&mut self, s: String) -> ObjRef {
        self.intern(&s)
    }

    pub fn alloc_function(&mut self, function: ObjFunction) -> ObjRef {
        self.alloc(Obj::Function(function))
    }

    pub fn alloc_native(
        &mut self,
        name: ObjRef,
        function: crate::object::NativeFn,
    ) -> ObjRef {
        self.alloc(Obj::Native(crate::object::ObjNative { name, function }))
    }

    pub fn alloc_closure(&mut self, function: ObjRef, upvalues: Vec<ObjRef>) -> ObjRef {
        self.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues,
        }))
    }

    pub fn alloc_upvalue(&mut self, stack_index: usize) -> ObjRef {
        self.alloc(Obj::Upvalue(ObjUpvalue::new_open(stack_index)))
    }

    pub fn alloc_class(&mut self, name: ObjRef) -> ObjRef {
        self.alloc(Obj::Class(ObjClass {
            name,
            methods: RefCell::new(Table::new()),
        }))
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        self.alloc(Obj::Instance(ObjInstance {
            class,
            fields: RefCell::new(Table::new()),
        }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_reference_identity() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        let c = heap.intern("world");
        assert_ne!(a, c);
    }

    #[test]
    fn concatenation_result_interns_same_as_literal() {
        let mut heap = Heap::new();
        let concatenated = heap.intern_owned(format!("{}{}", "foo", "bar"));
        let literal = heap.intern("foobar");
        assert_eq!(concatenated, literal);
    }

    #[test]
    fn allocation_tracks_bytes() {
        let mut heap = Heap::new();
        assert_eq!(heap.bytes_allocated(), 0);
        heap.intern("x");
        assert!(heap.bytes_allocated() > 0);
    }
}
