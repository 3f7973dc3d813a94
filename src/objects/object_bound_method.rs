use crate::objects::{
    object::{Object, ObjectType},
    object_closure::ObjectClosure,
};
use crate::value::Value;

// Pairs a receiver with the closure pulled out of its class, so the method
// can be called later with `this` already decided.
#[repr(C)]
pub struct ObjectBoundMethod {
    pub object: Object,
    pub receiver: Value,
    pub method: *mut ObjectClosure,
}

impl ObjectBoundMethod {
    pub fn new(receiver: Value, method: *mut ObjectClosure) -> Self {
        ObjectBoundMethod {
            object: Object {
                obj_type: ObjectType::ObjBoundMethod,
            },
            receiver,
            method,
        }
    }
}
