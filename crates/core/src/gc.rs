//! Tri-color mark-and-sweep collection (§4.H).
//!
//! This crate knows how to trace the children of any [`Obj`] it owns, but it
//! has no notion of a VM stack or call frames — those roots belong to
//! `rlox-vm` (and, during compilation, to `rlox-compiler`). [`collect`] takes
//! a caller-supplied closure to mark those external roots, and marks
//! [`Heap`]'s own transient roots ([`Heap::push_root`]) itself.

use crate::heap::Heap;
use crate::object::{Obj, ObjRef, Upvalue};
use crate::table::Table;
use crate::value::Value;

/// Accumulates gray (marked, not yet traced) objects during the mark phase.
/// Handed to the root-marking closure so callers outside this crate can mark
/// their own roots without reaching into collection internals.
pub struct Marker<'a> {
    gray: &'a mut Vec<ObjRef>,
}

impl<'a> Marker<'a> {
    pub fn mark_object(&mut self, r: ObjRef) {
        if r.is_marked() {
            return;
        }
        r.set_marked(true);
        self.gray.push(r);
    }

    pub fn mark_value(&mut self, v: Value) {
        if v.is_obj() {
            self.mark_object(v.as_obj());
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }
}

/// Summary of one collection cycle, surfaced to `debug!`/`trace!` logging
/// (SPEC_FULL §10) rather than the C original's `#ifdef DEBUG_LOG_GC` prints.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectReport {
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub objects_freed: usize,
}

impl CollectReport {
    pub fn bytes_freed(&self) -> usize {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Runs one full mark/trace/sweep cycle over `heap` (§4.H steps 1-5).
///
/// `mark_roots` is invoked once with a [`Marker`] so the caller can mark
/// whatever it considers a root: the value stack, call frames' closures,
/// the open-upvalues list, the globals table, the interned `"init"` string,
/// and (mid-compilation) each enclosing `FunctionCompiler`'s own chunk.
pub fn collect(heap: &mut Heap, mark_roots: impl FnOnce(&mut Marker)) -> CollectReport {
    let bytes_before = heap.bytes_allocated();
    tracing::trace!(bytes_before, "gc begin");
    let mut gray: Vec<ObjRef> = Vec::new();

    {
        let mut marker = Marker { gray: &mut gray };
        for &root in heap.temp_roots() {
            marker.mark_value(root);
        }
        mark_roots(&mut marker);
    }

    while let Some(r) = gray.pop() {
        trace_references(r, &mut gray);
    }

    // Intern-table entries whose string went unmarked must be dropped before
    // sweep frees the underlying object, or the table would hold a dangling
    // key (§4.H step 3).
    heap.strings_table().remove_white();

    let objects_freed = sweep(heap);
    heap.update_next_gc();

    let report = CollectReport {
        bytes_before,
        bytes_after: heap.bytes_allocated(),
        objects_freed,
    };
    tracing::debug!(
        bytes_freed = report.bytes_freed(),
        objects_freed,
        next_gc = heap.next_gc(),
        "gc end"
    );
    report
}

/// Marks every object directly reachable from `r`'s own fields (§4.H step 2).
fn trace_references(r: ObjRef, gray: &mut Vec<ObjRef>) {
    let mut marker = Marker { gray };
    match r.get() {
        Obj::String(_) | Obj::Native(_) => {}
        Obj::Upvalue(u) => {
            if let Upvalue::Closed = u.state() {
                marker.mark_value(u.get_closed());
            }
        }
        Obj::Function(f) => {
            if let Some(name) = f.name {
                marker.mark_object(name);
            }
            f.chunk.mark_constants(&mut |v| marker.mark_value(v));
        }
        Obj::Closure(c) => {
            marker.mark_object(c.function);
            for &u in &c.upvalues {
                marker.mark_object(u);
            }
        }
        Obj::Class(cl) => {
            marker.mark_object(cl.name);
            marker.mark_table(&cl.methods.borrow());
        }
        Obj::Instance(i) => {
            marker.mark_object(i.class);
            marker.mark_table(&i.fields.borrow());
        }
        Obj::BoundMethod(b) => {
            marker.mark_value(b.receiver);
            marker.mark_object(b.method);
        }
    }
}

/// Walks the intrusive all-objects list, freeing every unmarked (white)
/// object and clearing the mark bit on every survivor for the next cycle
/// (§4.H step 5).
fn sweep(heap: &mut Heap) -> usize {
    let mut freed = 0;
    let mut previous: Option<ObjRef> = None;
    let mut current = heap.objects_head();

    while let Some(r) = current {
        let next = r.next();
        if r.is_marked() {
            r.set_marked(false);
            previous = Some(r);
        } else {
            match previous {
                Some(p) => p.set_next(next),
                None => heap.set_objects_head(next),
            }
            heap.free_object(r);
            freed += 1;
        }
        current = next;
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn unreachable_string_is_collected() {
        let mut heap = Heap::new();
        let _kept = heap.intern("kept");
        heap.intern("garbage");
        let report = collect(&mut heap, |marker| {
            marker.mark_object(_kept);
        });
        assert_eq!(report.objects_freed, 1);
    }

    #[test]
    fn marked_roots_survive_a_cycle() {
        let mut heap = Heap::new();
        let s = heap.intern("alive");
        let report = collect(&mut heap, |marker| marker.mark_value(Value::obj(s)));
        assert_eq!(report.objects_freed, 0);
        assert_eq!(s.as_string().unwrap().as_str(), "alive");
    }

    #[test]
    fn temp_roots_are_marked_automatically() {
        let mut heap = Heap::new();
        let s = heap.intern("temp");
        heap.push_root(Value::obj(s));
        let report = collect(&mut heap, |_marker| {});
        heap.pop_root();
        assert_eq!(report.objects_freed, 0);
    }
}
