use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectType};

// A compiled function. The name is empty for the top-level script.
#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Box<Chunk>,
    pub name: String,
}

impl ObjectFunction {
    pub fn new(arity: usize, name: String) -> Self {
        ObjectFunction {
            object: Object {
                obj_type: ObjectType::ObjFunction,
            },
            arity,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }
}
