use crate::objects::{
    object::{Object, ObjectType},
    object_function::ObjectFunction,
    object_upvalue::ObjectUpvalue,
};

// The upvalues vector is filled in by the Closure instruction right after
// allocation; it ends up with exactly function.upvalue_count entries.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction) -> Self {
        let upvalue_count = unsafe { (*function).upvalue_count };
        ObjectClosure {
            object: Object {
                obj_type: ObjectType::ObjClosure,
            },
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }
}
