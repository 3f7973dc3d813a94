use crate::objects::object::{Object, ObjectType};
use crate::table::Table;

// Method values are closures keyed by interned name.
#[repr(C)]
pub struct ObjectClass {
    pub object: Object,
    pub name: String,
    pub methods: Table,
}

impl ObjectClass {
    pub fn new(name: String) -> Self {
        ObjectClass {
            object: Object {
                obj_type: ObjectType::ObjClass,
            },
            name,
            methods: Table::new(),
        }
    }
}
