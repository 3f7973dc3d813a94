use crate::objects::{
    object_bound_method::ObjectBoundMethod, object_class::ObjectClass,
    object_closure::ObjectClosure, object_function::ObjectFunction,
    object_instance::ObjectInstance, object_native_function::ObjectNativeFunction,
    object_string::ObjectString, object_upvalue::ObjectUpvalue,
};
use crate::table::Entry;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    ObjString,
    ObjFunction,
    ObjNativeFunction,
    ObjClosure,
    ObjUpvalue,
    ObjClass,
    ObjInstance,
    ObjBoundMethod,
}

// Every heap object embeds this header as its first field, so a pointer to
// the concrete struct and a pointer to its Object header are interchangeable.
// All object structs are #[repr(C)] to keep the header first.
#[repr(C)]
pub struct Object {
    pub obj_type: ObjectType,
}

pub trait NativeObject {
    fn run(&self, args: &[Value]) -> Result<Value, String>;
}

impl Object {
    pub unsafe fn as_string(&self) -> &ObjectString {
        debug_assert!(self.obj_type == ObjectType::ObjString);
        &*(self as *const Object as *const ObjectString)
    }

    pub unsafe fn as_function(&self) -> &ObjectFunction {
        debug_assert!(self.obj_type == ObjectType::ObjFunction);
        &*(self as *const Object as *const ObjectFunction)
    }

    pub unsafe fn as_native_function(&self) -> &ObjectNativeFunction {
        debug_assert!(self.obj_type == ObjectType::ObjNativeFunction);
        &*(self as *const Object as *const ObjectNativeFunction)
    }

    pub unsafe fn as_closure(&self) -> &ObjectClosure {
        debug_assert!(self.obj_type == ObjectType::ObjClosure);
        &*(self as *const Object as *const ObjectClosure)
    }

    pub unsafe fn as_upvalue(&self) -> &ObjectUpvalue {
        debug_assert!(self.obj_type == ObjectType::ObjUpvalue);
        &*(self as *const Object as *const ObjectUpvalue)
    }

    pub unsafe fn as_class(&self) -> &ObjectClass {
        debug_assert!(self.obj_type == ObjectType::ObjClass);
        &*(self as *const Object as *const ObjectClass)
    }

    pub unsafe fn as_instance(&self) -> &ObjectInstance {
        debug_assert!(self.obj_type == ObjectType::ObjInstance);
        &*(self as *const Object as *const ObjectInstance)
    }

    pub unsafe fn as_bound_method(&self) -> &ObjectBoundMethod {
        debug_assert!(self.obj_type == ObjectType::ObjBoundMethod);
        &*(self as *const Object as *const ObjectBoundMethod)
    }

    /// Approximate footprint of the object plus the heap payloads it owns.
    /// Feeds the allocation budget that schedules collections.
    pub unsafe fn deep_size(&self) -> usize {
        match self.obj_type {
            ObjectType::ObjString => {
                let string = self.as_string();
                std::mem::size_of::<ObjectString>() + string.content.capacity()
            }
            ObjectType::ObjFunction => {
                let function = self.as_function();
                std::mem::size_of::<ObjectFunction>()
                    + function.name.capacity()
                    + function.chunk.byte_size()
            }
            ObjectType::ObjNativeFunction => {
                let native = self.as_native_function();
                std::mem::size_of::<ObjectNativeFunction>() + native.name.capacity()
            }
            ObjectType::ObjClosure => {
                let closure = self.as_closure();
                std::mem::size_of::<ObjectClosure>()
                    + closure.upvalues.capacity() * std::mem::size_of::<*mut ObjectUpvalue>()
            }
            ObjectType::ObjUpvalue => std::mem::size_of::<ObjectUpvalue>(),
            ObjectType::ObjClass => {
                let class = self.as_class();
                std::mem::size_of::<ObjectClass>()
                    + class.name.capacity()
                    + class.methods.capacity() * std::mem::size_of::<Entry>()
            }
            ObjectType::ObjInstance => {
                let instance = self.as_instance();
                std::mem::size_of::<ObjectInstance>()
                    + instance.fields.capacity() * std::mem::size_of::<Entry>()
            }
            ObjectType::ObjBoundMethod => std::mem::size_of::<ObjectBoundMethod>(),
        }
    }
}
