use std::collections::HashSet;

use crate::constants::{GC_FIRST_TRIGGER, GC_HEAP_GROW_FACTOR};
use crate::gc::gc_trace;
use crate::objects::{
    object::{NativeObject, Object, ObjectType},
    object_bound_method::ObjectBoundMethod,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::ObjectFunction,
    object_instance::ObjectInstance,
    object_native_function::ObjectNativeFunction,
    object_string::ObjectString,
    object_upvalue::ObjectUpvalue,
};
use crate::value::Value;

// Owns every heap object the compiler and VM create. Allocation goes through
// the alloc_* methods, which box the object, leak it to a raw pointer, and
// record it so a later sweep (or drop of the manager) can free it.
pub struct ObjectManager {
    objects: Vec<*mut Object>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_TRIGGER,
            stress: cfg!(feature = "stress_gc"),
        }
    }

    fn track(&mut self, ptr: *mut Object, size: usize) {
        self.objects.push(ptr);
        self.bytes_allocated += size;
        gc_trace!("allocate {} bytes ptr={:p}", size, ptr);
    }

    pub fn alloc_string(&mut self, content: &str, hash: u32) -> (*mut ObjectString, usize) {
        let ptr = Box::into_raw(ObjectString::new(content, hash));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn alloc_function(&mut self, arity: usize, name: String) -> (*mut ObjectFunction, usize) {
        let ptr = Box::into_raw(Box::new(ObjectFunction::new(arity, name)));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn alloc_native_function<T: NativeObject + 'static>(
        &mut self,
        name: String,
        arity: usize,
        native_object: T,
    ) -> (*mut ObjectNativeFunction, usize) {
        let ptr = Box::into_raw(Box::new(ObjectNativeFunction::new(name, arity, native_object)));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn alloc_closure(&mut self, function: *mut ObjectFunction) -> (*mut ObjectClosure, usize) {
        let ptr = Box::into_raw(Box::new(ObjectClosure::new(function)));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> (*mut ObjectUpvalue, usize) {
        let ptr = Box::into_raw(Box::new(ObjectUpvalue::new(location)));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn alloc_class(&mut self, name: String) -> (*mut ObjectClass, usize) {
        let ptr = Box::into_raw(Box::new(ObjectClass::new(name)));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn alloc_instance(&mut self, class: *mut ObjectClass) -> (*mut ObjectInstance, usize) {
        let ptr = Box::into_raw(Box::new(ObjectInstance::new(class)));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: *mut ObjectClosure,
    ) -> (*mut ObjectBoundMethod, usize) {
        let ptr = Box::into_raw(Box::new(ObjectBoundMethod::new(receiver, method)));
        let size = unsafe { (*(ptr as *mut Object)).deep_size() };
        self.track(ptr as *mut Object, size);
        (ptr, size)
    }

    pub fn iter(&self) -> impl Iterator<Item = &*mut Object> {
        self.objects.iter()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// Free every object in `unreachable`, unlink it, and return the number
    /// of bytes released. Live byte accounting is recomputed from the
    /// survivors, since chunks and tables grow after their owning object was
    /// first tracked.
    pub fn release_unreachable(&mut self, unreachable: &HashSet<*mut Object>) -> usize {
        let mut freed = 0;
        self.objects.retain(|&ptr| {
            if unreachable.contains(&ptr) {
                unsafe {
                    freed += (*ptr).deep_size();
                    free_object(ptr);
                }
                false
            } else {
                true
            }
        });
        self.bytes_allocated = self
            .objects
            .iter()
            .map(|&ptr| unsafe { (*ptr).deep_size() })
            .sum();
        freed
    }

    /// Re-arm the collection trigger after a completed cycle.
    pub fn rearm(&mut self) {
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        gc_trace!("next collection at {} bytes", self.next_gc);
    }

    pub unsafe fn free_all(&mut self) {
        for &ptr in &self.objects {
            free_object(ptr);
        }
        self.objects.clear();
        self.bytes_allocated = 0;
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        unsafe {
            self.free_all();
        }
    }
}

// Reconstructing the Box with the concrete type matters: each kind has its
// own layout and Drop glue.
unsafe fn free_object(ptr: *mut Object) {
    gc_trace!("free ptr={:p} type={:?}", ptr, (*ptr).obj_type);
    match (*ptr).obj_type {
        ObjectType::ObjString => drop(Box::from_raw(ptr as *mut ObjectString)),
        ObjectType::ObjFunction => drop(Box::from_raw(ptr as *mut ObjectFunction)),
        ObjectType::ObjNativeFunction => drop(Box::from_raw(ptr as *mut ObjectNativeFunction)),
        ObjectType::ObjClosure => drop(Box::from_raw(ptr as *mut ObjectClosure)),
        ObjectType::ObjUpvalue => drop(Box::from_raw(ptr as *mut ObjectUpvalue)),
        ObjectType::ObjClass => drop(Box::from_raw(ptr as *mut ObjectClass)),
        ObjectType::ObjInstance => drop(Box::from_raw(ptr as *mut ObjectInstance)),
        ObjectType::ObjBoundMethod => drop(Box::from_raw(ptr as *mut ObjectBoundMethod)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_string::hash_string;

    #[test]
    fn allocations_are_tracked() {
        let mut manager = ObjectManager::new();
        let (_, size) = manager.alloc_string("tracked", hash_string(b"tracked"));
        assert!(size > 0);
        assert_eq!(manager.iter().count(), 1);
        assert_eq!(manager.bytes_allocated(), size);
    }

    #[test]
    fn release_unreachable_frees_and_recounts() {
        let mut manager = ObjectManager::new();
        let (keep, _) = manager.alloc_string("keep", hash_string(b"keep"));
        let (drop1, _) = manager.alloc_string("drop", hash_string(b"drop"));

        let mut unreachable = HashSet::new();
        unreachable.insert(drop1 as *mut Object);
        let freed = manager.release_unreachable(&unreachable);

        assert!(freed > 0);
        assert_eq!(manager.iter().count(), 1);
        assert_eq!(*manager.iter().next().unwrap(), keep as *mut Object);
    }
}
