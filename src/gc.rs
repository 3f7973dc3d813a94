use std::collections::HashSet;

use crate::{
    call_frame::CallFrame,
    objects::{
        object::{Object, ObjectType},
        object_function::ObjectFunction,
        object_manager::ObjectManager,
        object_string::ObjectString,
        object_upvalue::ObjectUpvalue,
    },
    table::Table,
    value::{as_object, is_object, Value},
};

// Tri-color mark-and-sweep. Whites are candidates, grays form the explicit
// worklist, blacks are fully scanned. A cycle is: prepare_collection,
// mark_roots (or mark_compiler_roots), trace_references, the caller's
// weak-intern pass, then sweep.
pub struct GarbageCollector {
    white_set: HashSet<*mut Object>,
    gray_set: HashSet<*mut Object>,
    black_set: HashSet<*mut Object>,
    stats: GCStats,
}

/// Aggregated GC statistics (does not include currently-live total bytes; the
/// object manager tracks that).
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with the gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => {}; }
pub(crate) use gc_trace;

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            white_set: HashSet::new(),
            gray_set: HashSet::new(),
            black_set: HashSet::new(),
            stats: GCStats::default(),
        }
    }

    // Start a cycle with every managed object in the white set.
    pub fn prepare_collection(&mut self, object_manager: &ObjectManager) {
        self.reset();
        for &obj_ptr in object_manager.iter() {
            self.white_set.insert(obj_ptr);
        }
    }

    // Move an object from white to gray.
    pub fn mark_object(&mut self, obj: *mut Object) {
        if obj.is_null() || self.black_set.contains(&obj) {
            return;
        }

        if self.white_set.remove(&obj) {
            self.gray_set.insert(obj);
            gc_trace!("mark_object enqueue gray ptr={:p}", obj);
        }
    }

    pub fn mark_value(&mut self, value: &Value) {
        if !is_object(value) {
            return;
        }
        self.mark_object(as_object(value));
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key as *mut Object);
            self.mark_value(&value);
        }
    }

    // The run-time root set.
    pub fn mark_roots(
        &mut self,
        stack: &[Value],
        stack_top: usize,
        globals: &Table,
        frames: &[CallFrame],
        open_upvalues: &[*mut ObjectUpvalue],
        init_string: *mut ObjectString,
    ) {
        for value in &stack[0..stack_top] {
            self.mark_value(value);
        }

        for frame in frames {
            self.mark_object(frame.closure as *mut Object);
        }

        for &upvalue in open_upvalues {
            self.mark_object(upvalue as *mut Object);
        }

        self.mark_table(globals);
        self.mark_object(init_string as *mut Object);
    }

    // The compile-time root set: every function still being built, plus the
    // intern table and the session globals. Interns are held strongly here;
    // the weak pass on run-time cycles reclaims whatever they keep alive.
    pub fn mark_compiler_roots(
        &mut self,
        functions: &[*mut ObjectFunction],
        globals: &Table,
        intern_strings: &Table,
    ) {
        for &function in functions {
            self.mark_object(function as *mut Object);
        }
        self.mark_table(globals);
        self.mark_table(intern_strings);
    }

    // Drain the gray worklist, blackening as we go.
    pub fn trace_references(&mut self) {
        while !self.gray_set.is_empty() {
            let obj = *self.gray_set.iter().next().expect("gray set is non-empty");
            self.gray_set.remove(&obj);
            self.black_set.insert(obj);

            unsafe {
                gc_trace!("trace gray -> black ptr={:p}", obj);
                self.blacken_object(obj);
            }
        }
    }

    // Mark everything an object references.
    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).obj_type {
            ObjectType::ObjString | ObjectType::ObjNativeFunction => {}
            ObjectType::ObjFunction => {
                let function = (*object).as_function();
                for constant in function.chunk.iter_constants() {
                    self.mark_value(constant);
                }
            }
            ObjectType::ObjClosure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue as *mut Object);
                }
            }
            ObjectType::ObjUpvalue => {
                // Safe for open upvalues too: the stack slot is a root and
                // the closed cell is nil until the upvalue closes.
                let upvalue = (*object).as_upvalue();
                self.mark_value(&upvalue.closed);
            }
            ObjectType::ObjClass => {
                let class = (*object).as_class();
                self.mark_table(&class.methods);
            }
            ObjectType::ObjInstance => {
                let instance = (*object).as_instance();
                self.mark_object(instance.class as *mut Object);
                self.mark_table(&instance.fields);
            }
            ObjectType::ObjBoundMethod => {
                let bound = (*object).as_bound_method();
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method as *mut Object);
            }
        }
    }

    /// Whether a cycle's tracing reached the object. Valid between
    /// trace_references and sweep; used by the weak-intern pass.
    pub fn is_marked(&self, object: *mut Object) -> bool {
        self.black_set.contains(&object) || self.gray_set.contains(&object)
    }

    // Free everything still white and hand the memory back to the manager.
    pub fn sweep(&mut self, object_manager: &mut ObjectManager) -> usize {
        let freed_bytes = object_manager.release_unreachable(&self.white_set);
        self.white_set.clear();
        gc_trace!("sweep freed_bytes={}", freed_bytes);
        freed_bytes
    }

    pub fn reset(&mut self) {
        self.white_set.clear();
        self.gray_set.clear();
        self.black_set.clear();
    }

    /// Record a completed cycle (the caller knows bytes before/after and the
    /// next trigger).
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_string::hash_string;
    use crate::value::{make_nil_value, make_object_value, make_string_value, Value};

    fn run_cycle(
        gc: &mut GarbageCollector,
        manager: &mut ObjectManager,
        stack: &[Value],
        stack_top: usize,
        globals: &Table,
        open_upvalues: &[*mut ObjectUpvalue],
    ) -> usize {
        gc.prepare_collection(manager);
        gc.mark_roots(stack, stack_top, globals, &[], open_upvalues, std::ptr::null_mut());
        gc.trace_references();
        gc.sweep(manager)
    }

    #[test]
    fn collects_unreachable_objects() {
        let mut manager = ObjectManager::new();
        let (keep, _) = manager.alloc_string("keep", hash_string(b"keep"));
        manager.alloc_string("drop1", hash_string(b"drop1"));
        manager.alloc_string("drop2", hash_string(b"drop2"));

        let mut gc = GarbageCollector::new();
        let mut stack = [make_nil_value(); 8];
        stack[0] = make_object_value(keep as *mut Object);
        let globals = Table::new();

        let freed = run_cycle(&mut gc, &mut manager, &stack, 1, &globals, &[]);
        assert!(freed > 0, "expected some bytes to be freed");
        assert_eq!(manager.iter().count(), 1, "only the rooted object should remain");
    }

    #[test]
    fn preserves_closure_and_its_function() {
        let mut manager = ObjectManager::new();
        let (function, _) = manager.alloc_function(0, "f1".to_string());
        let (closure, _) = manager.alloc_closure(function);
        manager.alloc_function(0, "f2".to_string());

        let mut gc = GarbageCollector::new();
        let mut stack = [make_nil_value(); 8];
        stack[0] = make_object_value(closure as *mut Object);
        let globals = Table::new();

        run_cycle(&mut gc, &mut manager, &stack, 1, &globals, &[]);
        assert_eq!(manager.iter().count(), 2, "closure and its function should remain");
    }

    #[test]
    fn open_upvalue_roots_keep_their_targets() {
        let mut manager = ObjectManager::new();
        let (string_ptr, _) = manager.alloc_string("captured", hash_string(b"captured"));
        let mut stack = [make_nil_value(); 8];
        stack[0] = make_object_value(string_ptr as *mut Object);
        let (upvalue, _) = manager.alloc_upvalue(&mut stack[0] as *mut Value);

        let mut gc = GarbageCollector::new();
        let globals = Table::new();

        // Stack top is zero: the slot is only reachable through the upvalue's
        // closed cell once it closes.
        unsafe { (*upvalue).close() };
        run_cycle(&mut gc, &mut manager, &stack, 0, &globals, &[upvalue]);
        assert_eq!(manager.iter().count(), 2, "upvalue and captured string should remain");
    }

    #[test]
    fn unreachable_interned_strings_are_dropped_from_the_table() {
        let mut manager = ObjectManager::new();
        let mut interns = Table::new();
        let keep = make_string_value(&mut manager, &mut interns, "keep");
        make_string_value(&mut manager, &mut interns, "garbage");

        let mut gc = GarbageCollector::new();
        let mut stack = [make_nil_value(); 8];
        stack[0] = keep;
        let globals = Table::new();

        gc.prepare_collection(&manager);
        gc.mark_roots(&stack, 1, &globals, &[], &[], std::ptr::null_mut());
        gc.trace_references();
        interns.remove_white(|object| gc.is_marked(object));
        gc.sweep(&mut manager);

        assert_eq!(interns.len(), 1);
        assert_eq!(manager.iter().count(), 1);
    }

    #[test]
    fn instance_keeps_class_and_fields_alive() {
        let mut manager = ObjectManager::new();
        let mut interns = Table::new();
        let (class, _) = manager.alloc_class("Point".to_string());
        let (instance, _) = manager.alloc_instance(class);
        let field_name = make_string_value(&mut manager, &mut interns, "x");
        let field_value = make_string_value(&mut manager, &mut interns, "payload");
        unsafe {
            (*instance).fields.set(
                crate::value::as_string_object(&field_name),
                field_value,
            );
        }

        let mut gc = GarbageCollector::new();
        let mut stack = [make_nil_value(); 8];
        stack[0] = make_object_value(instance as *mut Object);
        let globals = Table::new();

        run_cycle(&mut gc, &mut manager, &stack, 1, &globals, &[]);
        // instance, class, field name string, field value string
        assert_eq!(manager.iter().count(), 4);
    }

    #[test]
    fn compiler_roots_keep_functions_under_construction() {
        let mut manager = ObjectManager::new();
        let (function, _) = manager.alloc_function(0, String::new());
        manager.alloc_string("floating", hash_string(b"floating"));

        let mut gc = GarbageCollector::new();
        let globals = Table::new();
        let interns = Table::new();
        gc.prepare_collection(&manager);
        gc.mark_compiler_roots(&[function], &globals, &interns);
        gc.trace_references();
        gc.sweep(&mut manager);

        assert_eq!(manager.iter().count(), 1);
    }

    #[test]
    fn stats_record_cycles() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_before_bytes, 1000);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().last_after_bytes, 600);
        assert_eq!(gc.stats().last_next_trigger_bytes, 1200);
        assert_eq!(gc.stats().total_freed_bytes, 400);
    }
}
