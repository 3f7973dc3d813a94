use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::NativeObject;
use crate::value::{make_number_value, Value};

pub struct ClockTime;

impl ClockTime {
    pub fn new() -> Self {
        ClockTime {}
    }
}

impl NativeObject for ClockTime {
    fn run(&self, _args: &[Value]) -> Result<Value, String> {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| "Time went backwards.".to_string())?;
        Ok(make_number_value(duration.as_secs_f64()))
    }
}
