use crate::objects::{
    object::{Object, ObjectType},
    object_bound_method::ObjectBoundMethod,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::ObjectFunction,
    object_instance::ObjectInstance,
    object_manager::ObjectManager,
    object_native_function::ObjectNativeFunction,
    object_string::{hash_string, ObjectString},
};
use crate::table::Table;

#[derive(Debug, PartialEq, Eq)]
pub enum ValueType {
    ValueBool,
    ValueNil,
    ValueNumber,
    ValueObject,
}

impl Copy for ValueType {}
impl Clone for ValueType {
    fn clone(&self) -> Self {
        *self
    }
}

pub union ValueUnion {
    pub boolean: bool,
    pub number: f64,
    pub object: *mut Object,
}

impl Copy for ValueUnion {}
impl Clone for ValueUnion {
    fn clone(&self) -> Self {
        *self
    }
}

pub struct Value {
    pub value_type: ValueType,
    pub value_as: ValueUnion,
}

impl Copy for Value {}
impl Clone for Value {
    fn clone(&self) -> Self {
        *self
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.value_type != other.value_type {
            return false;
        }

        unsafe {
            match self.value_type {
                ValueType::ValueBool => self.value_as.boolean == other.value_as.boolean,
                // IEEE semantics: NaN != NaN.
                ValueType::ValueNumber => self.value_as.number == other.value_as.number,
                // Identity. Interning makes this correct for strings too.
                ValueType::ValueObject => self.value_as.object == other.value_as.object,
                ValueType::ValueNil => true,
            }
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_value(self))
    }
}

#[inline(always)]
pub fn is_bool(value: &Value) -> bool {
    value.value_type == ValueType::ValueBool
}

#[inline(always)]
pub fn is_nil(value: &Value) -> bool {
    value.value_type == ValueType::ValueNil
}

#[inline(always)]
pub fn is_number(value: &Value) -> bool {
    value.value_type == ValueType::ValueNumber
}

#[inline(always)]
pub fn is_object(value: &Value) -> bool {
    value.value_type == ValueType::ValueObject
}

#[inline(always)]
fn is_object_type(value: &Value, obj_type: ObjectType) -> bool {
    is_object(value) && unsafe { (*as_object(value)).obj_type == obj_type }
}

#[inline(always)]
pub fn is_string(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjString)
}

#[inline(always)]
pub fn is_function(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjFunction)
}

#[inline(always)]
pub fn is_closure(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjClosure)
}

#[inline(always)]
pub fn is_class(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjClass)
}

#[inline(always)]
pub fn is_instance(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjInstance)
}

#[inline(always)]
pub fn as_bool(value: &Value) -> bool {
    if value.value_type == ValueType::ValueBool {
        return unsafe { value.value_as.boolean };
    }
    panic!("Unexpected value type. {:?}", value.value_type);
}

#[inline(always)]
pub fn as_number(value: &Value) -> f64 {
    if value.value_type == ValueType::ValueNumber {
        return unsafe { value.value_as.number };
    }
    panic!("Unexpected value type. {:?}", value.value_type);
}

#[inline(always)]
pub fn as_object(value: &Value) -> *mut Object {
    if value.value_type == ValueType::ValueObject {
        return unsafe { value.value_as.object };
    }
    panic!("Unexpected value type. {:?}", value.value_type);
}

#[inline(always)]
pub fn as_string_object(value: &Value) -> *mut ObjectString {
    as_object(value) as *mut ObjectString
}

#[inline(always)]
pub fn as_function_object(value: &Value) -> *mut ObjectFunction {
    as_object(value) as *mut ObjectFunction
}

#[inline(always)]
pub fn as_native_object(value: &Value) -> *mut ObjectNativeFunction {
    as_object(value) as *mut ObjectNativeFunction
}

#[inline(always)]
pub fn as_closure_object(value: &Value) -> *mut ObjectClosure {
    as_object(value) as *mut ObjectClosure
}

#[inline(always)]
pub fn as_class_object(value: &Value) -> *mut ObjectClass {
    as_object(value) as *mut ObjectClass
}

#[inline(always)]
pub fn as_instance_object(value: &Value) -> *mut ObjectInstance {
    as_object(value) as *mut ObjectInstance
}

#[inline(always)]
pub fn as_bound_method_object(value: &Value) -> *mut ObjectBoundMethod {
    as_object(value) as *mut ObjectBoundMethod
}

#[inline(always)]
pub fn make_bool_value(value: bool) -> Value {
    Value {
        value_type: ValueType::ValueBool,
        value_as: ValueUnion { boolean: value },
    }
}

#[inline(always)]
pub fn make_nil_value() -> Value {
    Value {
        value_type: ValueType::ValueNil,
        value_as: ValueUnion { number: 0.0 },
    }
}

#[inline(always)]
pub fn make_number_value(value: f64) -> Value {
    Value {
        value_type: ValueType::ValueNumber,
        value_as: ValueUnion { number: value },
    }
}

#[inline(always)]
pub fn make_object_value(object: *mut Object) -> Value {
    Value {
        value_type: ValueType::ValueObject,
        value_as: ValueUnion { object },
    }
}

#[inline(always)]
pub fn make_function_value(function: *mut ObjectFunction) -> Value {
    make_object_value(function as *mut Object)
}

/// Intern-aware string constructor: equal contents always yield the same
/// pointer. Callers that can trigger a collection must run it before calling
/// this, so the fresh allocation cannot be swept out from under them.
pub fn make_string_value(
    object_manager: &mut ObjectManager,
    intern_strings: &mut Table,
    content: &str,
) -> Value {
    let hash = hash_string(content.as_bytes());
    if let Some(interned) = intern_strings.find_string(content, hash) {
        return make_object_value(interned as *mut Object);
    }

    let (object_string, _size) = object_manager.alloc_string(content, hash);
    intern_strings.set(object_string, make_nil_value());
    make_object_value(object_string as *mut Object)
}

pub type ValueArray = Vec<Value>;

pub fn format_value(value: &Value) -> String {
    match value.value_type {
        ValueType::ValueNumber => format!("{}", as_number(value)),
        ValueType::ValueBool => {
            if as_bool(value) {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        ValueType::ValueNil => "nil".to_string(),
        ValueType::ValueObject => format_object(value),
    }
}

pub fn print_value(value: &Value) {
    print!("{}", format_value(value));
}

fn format_function(function: &ObjectFunction) -> String {
    if function.name.is_empty() {
        "<script>".to_string()
    } else {
        format!("<fn {}>", function.name)
    }
}

fn format_object(value: &Value) -> String {
    let object = as_object(value);
    unsafe {
        match (*object).obj_type {
            ObjectType::ObjString => (*object).as_string().content.clone(),
            ObjectType::ObjFunction => format_function((*object).as_function()),
            ObjectType::ObjNativeFunction => "<native fn>".to_string(),
            ObjectType::ObjClosure => format_function(&*(*object).as_closure().function),
            ObjectType::ObjUpvalue => "upvalue".to_string(),
            ObjectType::ObjClass => (*object).as_class().name.clone(),
            ObjectType::ObjInstance => {
                format!("{} instance", (*(*object).as_instance().class).name)
            }
            ObjectType::ObjBoundMethod => {
                format_function(&*(*(*object).as_bound_method().method).function)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_formatting_is_shortest_round_trip() {
        assert_eq!(format_value(&make_number_value(7.0)), "7");
        assert_eq!(format_value(&make_number_value(2.5)), "2.5");
        assert_eq!(format_value(&make_number_value(-0.1)), "-0.1");
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        let nan = make_number_value(f64::NAN);
        assert!(nan != nan);
    }

    #[test]
    fn nil_and_bool_equality() {
        assert!(make_nil_value() == make_nil_value());
        assert!(make_bool_value(true) == make_bool_value(true));
        assert!(make_bool_value(true) != make_bool_value(false));
        assert!(make_nil_value() != make_bool_value(false));
    }

    #[test]
    fn interned_strings_share_one_allocation() {
        let mut manager = ObjectManager::new();
        let mut interns = Table::new();
        let first = make_string_value(&mut manager, &mut interns, "twice");
        let second = make_string_value(&mut manager, &mut interns, "twice");
        assert!(first == second);
        assert_eq!(manager.iter().count(), 1);
        assert_eq!(interns.len(), 1);
    }

    #[test]
    fn function_values_format_by_name() {
        let mut manager = ObjectManager::new();
        let (function, _) = manager.alloc_function(0, "tick".to_string());
        assert_eq!(format_value(&make_function_value(function)), "<fn tick>");
        let (script, _) = manager.alloc_function(0, String::new());
        assert_eq!(format_value(&make_function_value(script)), "<script>");
    }
}
