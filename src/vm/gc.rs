//! Mark-and-sweep, non-moving garbage collector.
//!
//! Every heap object is linked into one intrusive, singly-linked list
//! through its [`ObjHeader`]. Marking walks outward from a caller-
//! supplied root set using an explicit gray worklist (no recursion, so
//! a deep object graph can't blow the host stack); sweeping walks the
//! all-objects list once, reclaiming anything whose reachable bit is
//! still clear and clearing the bit on everything that survives.

use std::cell::Cell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::config::HostAllocator;
use crate::value::object::{
    ClosureObj, DictObj, HeapObject, ListObj, ObjHeader, ObjKind, RangeObj, StringObj, UpvalueObj, UpvalueState,
};
use crate::value::Value;

pub struct Gc {
    head: Cell<*mut ObjHeader>,
    bytes_allocated: Cell<usize>,
    threshold: Cell<usize>,
    initial_threshold: usize,
    growth_factor: f64,
    allocator: Option<Rc<dyn HostAllocator>>,
}

impl Gc {
    pub fn new(initial_threshold: usize, growth_factor: f64) -> Self {
        Self::with_allocator(initial_threshold, growth_factor, None)
    }

    pub fn with_allocator(initial_threshold: usize, growth_factor: f64, allocator: Option<Rc<dyn HostAllocator>>) -> Self {
        Gc {
            head: Cell::new(std::ptr::null_mut()),
            bytes_allocated: Cell::new(0),
            threshold: Cell::new(initial_threshold),
            initial_threshold,
            growth_factor,
            allocator,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated.get() >= self.threshold.get()
    }

    /// Allocate and link a heap object. The caller is responsible for
    /// immediately storing the returned pointer somewhere reachable
    /// from a root before any further allocation can trigger a
    /// collection.
    pub fn alloc<T: HeapObject>(&self, value: T) -> *mut T {
        let ptr = Box::into_raw(Box::new(value));
        let header_ptr = ptr as *mut ObjHeader;
        unsafe {
            (*header_ptr).next.set(self.head.get());
        }
        self.head.set(header_ptr);
        let size = std::mem::size_of::<T>();
        self.bytes_allocated.set(self.bytes_allocated.get() + size);
        if let Some(allocator) = &self.allocator {
            allocator.on_alloc(size);
        }
        ptr
    }

    /// Run one full mark-and-sweep cycle rooted at `roots`.
    pub fn collect(&self, roots: impl IntoIterator<Item = Value>) {
        trace!(bytes_allocated = self.bytes_allocated.get(), "gc cycle starting");
        let mut gray = Vec::new();
        for root in roots {
            mark_value(&root, &mut gray);
        }
        while let Some(header_ptr) = gray.pop() {
            mark_children(header_ptr, &mut gray);
        }
        let (objects_freed, bytes_freed) = self.sweep();
        debug!(objects_freed, bytes_freed, bytes_allocated = self.bytes_allocated.get(), "gc cycle finished");
    }

    fn sweep(&self) -> (usize, usize) {
        let mut freed = 0usize;
        let mut objects_freed = 0usize;
        unsafe {
            let mut link: *const Cell<*mut ObjHeader> = &self.head;
            loop {
                let current = (*link).get();
                if current.is_null() {
                    break;
                }
                let header = &*current;
                if header.reachable.get() {
                    header.reachable.set(false);
                    link = &header.next;
                } else {
                    let next = header.next.get();
                    (*link).set(next);
                    freed += destroy(current);
                    objects_freed += 1;
                }
            }
        }
        self.bytes_allocated.set(self.bytes_allocated.get().saturating_sub(freed));
        if let Some(allocator) = &self.allocator {
            allocator.on_free(freed);
        }
        let grown = (self.bytes_allocated.get() as f64 * self.growth_factor) as usize;
        self.threshold.set(grown.max(self.initial_threshold));
        (objects_freed, freed)
    }
}

fn mark_header(header_ptr: *mut ObjHeader, gray: &mut Vec<*mut ObjHeader>) {
    if header_ptr.is_null() {
        return;
    }
    let header = unsafe { &*header_ptr };
    if header.reachable.get() {
        return;
    }
    header.reachable.set(true);
    gray.push(header_ptr);
}

fn mark_value(value: &Value, gray: &mut Vec<*mut ObjHeader>) {
    let header_ptr = match *value {
        Value::Str(p) => p as *mut ObjHeader,
        Value::Range(p) => p as *mut ObjHeader,
        Value::List(p) => p as *mut ObjHeader,
        Value::Dict(p) => p as *mut ObjHeader,
        Value::Upvalue(p) => p as *mut ObjHeader,
        Value::Closure(p) => p as *mut ObjHeader,
        Value::FunctionProto(p) => p as *mut ObjHeader,
        Value::NativeFn(p) => p as *mut ObjHeader,
        _ => return,
    };
    mark_header(header_ptr, gray);
}

/// Push everything directly reachable from the object at `header_ptr`
/// (already marked by the caller) onto the gray worklist.
fn mark_children(header_ptr: *mut ObjHeader, gray: &mut Vec<*mut ObjHeader>) {
    let kind = unsafe { (*header_ptr).kind };
    match kind {
        ObjKind::Str | ObjKind::Range | ObjKind::NativeFn | ObjKind::FunctionProto => {}
        ObjKind::List => {
            let list = header_ptr as *mut ListObj;
            let items = unsafe { (*list).items.borrow() };
            for v in items.iter() {
                mark_value(v, gray);
            }
        }
        ObjKind::Dict => {
            let dict = header_ptr as *mut DictObj;
            let entries = unsafe { (*dict).entries.borrow() };
            for (k, v) in entries.iter() {
                mark_value(k, gray);
                mark_value(v, gray);
            }
        }
        ObjKind::Upvalue => {
            let up = header_ptr as *mut UpvalueObj;
            if let UpvalueState::Closed(v) = unsafe { (*up).state.get() } {
                mark_value(&v, gray);
            }
        }
        ObjKind::Closure => {
            let closure = header_ptr as *mut ClosureObj;
            let proto = unsafe { (*closure).proto };
            if !proto.is_null() {
                mark_header(proto as *mut ObjHeader, gray);
            }
            for &upvalue in unsafe { (*closure).upvalues.iter() } {
                mark_header(upvalue as *mut ObjHeader, gray);
            }
        }
    }
}

/// # Safety
/// `header_ptr` must be the sole remaining pointer to a live object
/// previously allocated by [`Gc::alloc`] with a matching kind; the
/// caller (`sweep`) has just unlinked it from the all-objects list.
unsafe fn destroy(header_ptr: *mut ObjHeader) -> usize {
    let kind = unsafe { (*header_ptr).kind };
    match kind {
        ObjKind::Str => {
            drop(unsafe { Box::from_raw(header_ptr as *mut StringObj) });
            std::mem::size_of::<StringObj>()
        }
        ObjKind::Range => {
            drop(unsafe { Box::from_raw(header_ptr as *mut RangeObj) });
            std::mem::size_of::<RangeObj>()
        }
        ObjKind::List => {
            drop(unsafe { Box::from_raw(header_ptr as *mut ListObj) });
            std::mem::size_of::<ListObj>()
        }
        ObjKind::Dict => {
            drop(unsafe { Box::from_raw(header_ptr as *mut DictObj) });
            std::mem::size_of::<DictObj>()
        }
        ObjKind::Upvalue => {
            drop(unsafe { Box::from_raw(header_ptr as *mut UpvalueObj) });
            std::mem::size_of::<UpvalueObj>()
        }
        ObjKind::Closure => {
            drop(unsafe { Box::from_raw(header_ptr as *mut ClosureObj) });
            std::mem::size_of::<ClosureObj>()
        }
        ObjKind::FunctionProto => {
            drop(unsafe { Box::from_raw(header_ptr as *mut crate::value::object::FunctionProtoObj) });
            std::mem::size_of::<crate::value::object::FunctionProtoObj>()
        }
        ObjKind::NativeFn => {
            drop(unsafe { Box::from_raw(header_ptr as *mut crate::value::object::NativeFnObj) });
            std::mem::size_of::<crate::value::object::NativeFnObj>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::object::StringObj;

    fn make_string(gc: &Gc, s: &str) -> Value {
        let ptr = gc.alloc(StringObj {
            header: ObjHeader::new(ObjKind::Str),
            data: Box::from(s),
        });
        Value::Str(ptr)
    }

    #[test]
    fn unreferenced_objects_are_collected() {
        let gc = Gc::new(1 << 20, 2.0);
        let _dangling = make_string(&gc, "gone");
        assert_eq!(gc.bytes_allocated(), std::mem::size_of::<StringObj>());
        gc.collect(std::iter::empty());
        assert_eq!(gc.bytes_allocated(), 0);
    }

    #[test]
    fn rooted_objects_survive_and_clear_their_mark() {
        let gc = Gc::new(1 << 20, 2.0);
        let kept = make_string(&gc, "kept");
        gc.collect([kept]);
        assert_eq!(gc.bytes_allocated(), std::mem::size_of::<StringObj>());
        if let Value::Str(p) = kept {
            assert!(!unsafe { &*p }.header.reachable.get());
        }
    }

    #[test]
    fn list_contents_keep_their_elements_alive() {
        let gc = Gc::new(1 << 20, 2.0);
        let inner = make_string(&gc, "inner");
        let list_ptr = gc.alloc(ListObj {
            header: ObjHeader::new(ObjKind::List),
            items: std::cell::RefCell::new(vec![inner]),
        });
        let list = Value::List(list_ptr);
        gc.collect([list]);
        assert_eq!(gc.bytes_allocated(), std::mem::size_of::<StringObj>() + std::mem::size_of::<ListObj>());
    }
}
