use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

// While open, `location` points at a live value-stack slot. Closing copies
// the slot into `closed` and redirects `location` there, which works because
// the object itself never moves once allocated.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
}

impl ObjectUpvalue {
    pub fn new(location: *mut Value) -> Self {
        ObjectUpvalue {
            object: Object {
                obj_type: ObjectType::ObjUpvalue,
            },
            location,
            closed: make_nil_value(),
        }
    }

    pub unsafe fn close(&mut self) {
        self.closed = *self.location;
        self.location = &mut self.closed;
    }
}
