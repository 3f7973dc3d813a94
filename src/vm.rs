use std::io::{self, Write};

use crate::{
    call_frame::CallFrame,
    chunk::OpCode,
    compiler::Parser,
    constants::{MAX_FRAMES, MAX_STACK_SIZE},
    gc::{GCStats, GarbageCollector},
    objects::{
        object::{NativeObject, Object, ObjectType},
        object_class::ObjectClass,
        object_closure::ObjectClosure,
        object_manager::ObjectManager,
        object_native_function::ObjectNativeFunction,
        object_string::ObjectString,
        object_upvalue::ObjectUpvalue,
    },
    std_mod::time::ClockTime,
    table::Table,
    value::{
        as_bool, as_bound_method_object, as_class_object, as_closure_object, as_instance_object,
        as_native_object, as_number, as_object, as_string_object, format_value, is_bool,
        is_instance, is_nil, is_number, is_object, is_string, make_bool_value, make_nil_value,
        make_number_value, make_object_value, make_string_value, Value,
    },
};

pub type InterpretResult = Result<(), InterpretError>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    #[error("compile error")]
    Compile,
    #[error("runtime error")]
    Runtime,
}

pub struct VM {
    frames: Vec<CallFrame>,
    // Fixed size and never reallocated, so raw pointers into it (open
    // upvalues) stay valid for the VM's lifetime.
    stack: Vec<Value>,
    stack_top_pos: usize,
    globals: Table,
    intern_strings: Table,
    object_manager: ObjectManager,
    gc: GarbageCollector,
    // Sorted by strictly descending stack slot address.
    open_upvalues: Vec<*mut ObjectUpvalue>,
    init_string: *mut ObjectString,
    output: Box<dyn Write>,
}

impl VM {
    pub fn new() -> Box<VM> {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Program output (the print statement) goes through the given writer;
    /// tests hand in a buffer to capture it.
    pub fn with_output(output: Box<dyn Write>) -> Box<VM> {
        let mut vm = Box::new(VM {
            frames: Vec::with_capacity(MAX_FRAMES),
            stack: vec![make_nil_value(); MAX_STACK_SIZE],
            stack_top_pos: 0,
            globals: Table::new(),
            intern_strings: Table::new(),
            object_manager: ObjectManager::new(),
            gc: GarbageCollector::new(),
            open_upvalues: Vec::new(),
            init_string: std::ptr::null_mut(),
            output,
        });

        let init_value =
            make_string_value(&mut vm.object_manager, &mut vm.intern_strings, "init");
        vm.init_string = as_string_object(&init_value);

        vm.define_native("clock", 0, ClockTime::new());
        vm
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = {
            let mut parser = Parser::new(
                &mut self.object_manager,
                &mut self.intern_strings,
                &mut self.gc,
                &self.globals,
            );
            parser.compile(source)
        };

        let Some(function) = function else {
            return Err(InterpretError::Compile);
        };

        let (closure, _size) = self.object_manager.alloc_closure(function);
        self.push(make_object_value(closure as *mut Object))?;
        self.call_closure(closure, 0)?;
        self.run()
    }

    pub fn set_gc_stress(&mut self, stress: bool) {
        self.object_manager.set_stress(stress);
    }

    pub fn gc_stats(&self) -> &GCStats {
        self.gc.stats()
    }

    fn define_native(&mut self, name: &str, arity: usize, native: impl NativeObject + 'static) {
        let name_value = make_string_value(&mut self.object_manager, &mut self.intern_strings, name);
        let (native_ptr, _size) =
            self.object_manager
                .alloc_native_function(name.to_string(), arity, native);
        self.globals.set(
            as_string_object(&name_value),
            make_object_value(native_ptr as *mut Object),
        );
    }

    // The value stack is fixed size; running out of it is the same
    // user-visible error as running out of call frames.
    fn push(&mut self, value: Value) -> InterpretResult {
        if self.stack_top_pos >= MAX_STACK_SIZE {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack[self.stack_top_pos] = value;
        self.stack_top_pos += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        debug_assert!(self.stack_top_pos > 0, "value stack underflow");
        self.stack_top_pos -= 1;
        self.stack[self.stack_top_pos]
    }

    fn peek_steps(&self, distance: usize) -> Value {
        self.stack[self.stack_top_pos - distance - 1]
    }

    fn is_falsey(value: &Value) -> bool {
        is_nil(value) || (is_bool(value) && !as_bool(value))
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("No call frame.")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("No call frame.")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("No call frame.");
        let byte = unsafe { (&(*(*frame.closure).function).chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.current_frame();
        unsafe { *(*(*frame.closure).function).chunk.get_constant(index) }
    }

    fn read_string(&mut self) -> *mut ObjectString {
        let constant = self.read_constant();
        as_string_object(&constant)
    }

    fn reset_stack(&mut self) {
        self.stack_top_pos = 0;
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // Report a runtime error with a stack trace and leave the VM ready for
    // the next interpret call.
    fn runtime_error(&mut self, message: &str) -> InterpretError {
        let mut stderr = io::stderr();
        writeln!(stderr, "{}", message).expect("Failed to write to stderr");

        for frame in self.frames.iter().rev() {
            let function = unsafe { &*(*frame.closure).function };
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            if function.name.is_empty() {
                writeln!(stderr, "[line {}] in script", line).expect("Failed to write to stderr");
            } else {
                writeln!(stderr, "[line {}] in {}()", line, function.name)
                    .expect("Failed to write to stderr");
            }
        }

        self.reset_stack();
        InterpretError::Runtime
    }

    fn maybe_collect(&mut self) {
        if self.object_manager.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let before = self.object_manager.bytes_allocated();

        self.gc.prepare_collection(&self.object_manager);
        self.gc.mark_roots(
            &self.stack,
            self.stack_top_pos,
            &self.globals,
            &self.frames,
            &self.open_upvalues,
            self.init_string,
        );
        self.gc.trace_references();

        // Interns are weak at run time: drop entries for strings nothing
        // else reached so the sweep can free them.
        self.intern_strings
            .remove_white(|object| self.gc.is_marked(object));

        let freed = self.gc.sweep(&mut self.object_manager);
        self.object_manager.rearm();
        self.gc.record_cycle(
            before,
            freed,
            self.object_manager.bytes_allocated(),
            self.object_manager.next_gc(),
        );
    }

    fn run(&mut self) -> InterpretResult {
        loop {
            debug_feature::trace_instruction(self);

            let byte = self.read_byte();
            let Some(instruction) = OpCode::from_byte(byte) else {
                let message = format!("Unknown opcode {}.", byte);
                return Err(self.runtime_error(&message));
            };

            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant)?;
                }
                OpCode::Nil => self.push(make_nil_value())?,
                OpCode::True => self.push(make_bool_value(true))?,
                OpCode::False => self.push(make_bool_value(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().stack_base;
                    let value = self.stack[base + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().stack_base;
                    self.stack[base + slot] = self.peek_steps(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value)?,
                        None => {
                            let message = format!(
                                "Undefined variable '{}'.",
                                unsafe { &(*name).content }
                            );
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek_steps(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek_steps(0);
                    if self.globals.set(name, value) {
                        // Assignment never creates a global.
                        self.globals.delete(name);
                        let message = format!(
                            "Undefined variable '{}'.",
                            unsafe { &(*name).content }
                        );
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let value = unsafe { *(*(&(*closure).upvalues)[slot]).location };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek_steps(0);
                    let closure = self.current_frame().closure;
                    unsafe { *(*(&mut (*closure).upvalues)[slot]).location = value };
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek_steps(0);
                    if !is_instance(&receiver) {
                        return Err(self.runtime_error("Only instances have properties."));
                    }

                    let instance = as_instance_object(&receiver);
                    if let Some(value) = unsafe { (*instance).fields.get(name) } {
                        self.pop();
                        self.push(value)?;
                    } else {
                        let class = unsafe { (*instance).class };
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek_steps(1);
                    if !is_instance(&receiver) {
                        return Err(self.runtime_error("Only instances have fields."));
                    }

                    let instance = as_instance_object(&receiver);
                    let value = self.peek_steps(0);
                    unsafe { (*instance).fields.set(name, value) };
                    // Leave the assigned value as the expression result.
                    let value = self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(make_bool_value(a == b))?;
                }
                OpCode::Greater => self.binary_op(OpCode::Greater)?,
                OpCode::Less => self.binary_op(OpCode::Less)?,
                OpCode::Add => {
                    if is_string(&self.peek_steps(0)) && is_string(&self.peek_steps(1)) {
                        self.concatenate()?;
                    } else if is_number(&self.peek_steps(0)) && is_number(&self.peek_steps(1)) {
                        let b = as_number(&self.pop());
                        let a = as_number(&self.pop());
                        self.push(make_number_value(a + b))?;
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                OpCode::Subtract => self.binary_op(OpCode::Subtract)?,
                OpCode::Multiply => self.binary_op(OpCode::Multiply)?,
                OpCode::Divide => self.binary_op(OpCode::Divide)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(make_bool_value(Self::is_falsey(&value)))?;
                }
                OpCode::Negate => {
                    if !is_number(&self.peek_steps(0)) {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                    let value = self.pop();
                    self.push(make_number_value(-as_number(&value)))?;
                }
                OpCode::Print => {
                    let value = self.pop();
                    writeln!(self.output, "{}", format_value(&value))
                        .expect("Failed to write output");
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if Self::is_falsey(&self.peek_steps(0)) {
                        self.current_frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let argument_count = self.read_byte() as usize;
                    let callee = self.peek_steps(argument_count);
                    self.call_value(callee, argument_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argument_count = self.read_byte() as usize;
                    self.invoke(name, argument_count)?;
                }
                OpCode::Closure => {
                    let function_value = self.read_constant();
                    let function = crate::value::as_function_object(&function_value);
                    self.maybe_collect();
                    let (closure, _size) = self.object_manager.alloc_closure(function);
                    self.push(make_object_value(closure as *mut Object))?;

                    let upvalue_count = unsafe { (*function).upvalue_count };
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.current_frame().stack_base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.current_frame().closure;
                            unsafe { (&(*enclosing).upvalues)[index] }
                        };
                        unsafe { (*closure).upvalues.push(upvalue) };
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack_top_pos - 1);
                    self.pop();
                }
                OpCode::Class => {
                    let name = self.read_string();
                    self.maybe_collect();
                    let class_name = unsafe { (*name).content.clone() };
                    let (class, _size) = self.object_manager.alloc_class(class_name);
                    self.push(make_object_value(class as *mut Object))?;
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek_steps(0);
                    let class = as_class_object(&self.peek_steps(1));
                    unsafe { (*class).methods.set(name, method) };
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("No call frame.");
                    self.close_upvalues(frame.stack_base);

                    if self.frames.is_empty() {
                        // Pop the script closure itself; the stack is empty
                        // between top-level statements.
                        self.pop();
                        return Ok(());
                    }

                    self.stack_top_pos = frame.stack_base;
                    self.push(result)?;
                }
            }
        }
    }

    fn binary_op(&mut self, op_code: OpCode) -> InterpretResult {
        if !is_number(&self.peek_steps(0)) || !is_number(&self.peek_steps(1)) {
            return Err(self.runtime_error("Operands must be numbers."));
        }

        let b = as_number(&self.pop());
        let a = as_number(&self.pop());
        match op_code {
            OpCode::Greater => self.push(make_bool_value(a > b)),
            OpCode::Less => self.push(make_bool_value(a < b)),
            OpCode::Subtract => self.push(make_number_value(a - b)),
            OpCode::Multiply => self.push(make_number_value(a * b)),
            OpCode::Divide => self.push(make_number_value(a / b)),
            _ => unreachable!("Unexpected binary operator: {}", op_code),
        }
    }

    // Both operands stay on the stack until the result has been allocated,
    // so a collection triggered here cannot free them.
    fn concatenate(&mut self) -> InterpretResult {
        let b = self.peek_steps(0);
        let a = self.peek_steps(1);

        let mut content = unsafe { (*as_string_object(&a)).content.clone() };
        content.push_str(unsafe { &(*as_string_object(&b)).content });

        self.maybe_collect();
        let result = make_string_value(&mut self.object_manager, &mut self.intern_strings, &content);
        self.pop();
        self.pop();
        self.push(result)
    }

    fn call_value(&mut self, callee: Value, argument_count: usize) -> InterpretResult {
        if is_object(&callee) {
            match unsafe { (*as_object(&callee)).obj_type } {
                ObjectType::ObjClosure => {
                    return self.call_closure(as_closure_object(&callee), argument_count)
                }
                ObjectType::ObjNativeFunction => {
                    return self.call_native(as_native_object(&callee), argument_count)
                }
                ObjectType::ObjClass => {
                    return self.call_class(as_class_object(&callee), argument_count)
                }
                ObjectType::ObjBoundMethod => {
                    let bound = as_bound_method_object(&callee);
                    let slot = self.stack_top_pos - argument_count - 1;
                    self.stack[slot] = unsafe { (*bound).receiver };
                    return self.call_closure(unsafe { (*bound).method }, argument_count);
                }
                _ => {}
            }
        }

        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call_closure(&mut self, closure: *mut ObjectClosure, argument_count: usize) -> InterpretResult {
        let arity = unsafe { (*(*closure).function).arity };
        if argument_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, argument_count);
            return Err(self.runtime_error(&message));
        }

        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames
            .push(CallFrame::new(closure, self.stack_top_pos - argument_count - 1));
        Ok(())
    }

    fn call_native(
        &mut self,
        native: *mut ObjectNativeFunction,
        argument_count: usize,
    ) -> InterpretResult {
        let args_start = self.stack_top_pos - argument_count;
        let result = unsafe { (*native).invoke(&self.stack[args_start..self.stack_top_pos]) };
        match result {
            Ok(value) => {
                self.stack_top_pos -= argument_count + 1;
                self.push(value)
            }
            Err(message) => Err(self.runtime_error(&message)),
        }
    }

    fn call_class(&mut self, class: *mut ObjectClass, argument_count: usize) -> InterpretResult {
        self.maybe_collect();
        let (instance, _size) = self.object_manager.alloc_instance(class);
        let slot = self.stack_top_pos - argument_count - 1;
        self.stack[slot] = make_object_value(instance as *mut Object);

        if let Some(initializer) = unsafe { (*class).methods.get(self.init_string) } {
            self.call_closure(as_closure_object(&initializer), argument_count)
        } else if argument_count != 0 {
            let message = format!("Expected 0 arguments but got {}.", argument_count);
            Err(self.runtime_error(&message))
        } else {
            Ok(())
        }
    }

    // receiver.name(args): a field of that name shadows the method and is
    // called as a plain value; otherwise the method is called directly with
    // no bound-method allocation.
    fn invoke(&mut self, name: *mut ObjectString, argument_count: usize) -> InterpretResult {
        let receiver = self.peek_steps(argument_count);
        if !is_instance(&receiver) {
            return Err(self.runtime_error("Only instances have methods."));
        }

        let instance = as_instance_object(&receiver);
        if let Some(field) = unsafe { (*instance).fields.get(name) } {
            let slot = self.stack_top_pos - argument_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, argument_count);
        }

        let class = unsafe { (*instance).class };
        self.invoke_from_class(class, name, argument_count)
    }

    fn invoke_from_class(
        &mut self,
        class: *mut ObjectClass,
        name: *mut ObjectString,
        argument_count: usize,
    ) -> InterpretResult {
        let Some(method) = (unsafe { (*class).methods.get(name) }) else {
            let message = format!("Undefined property '{}'.", unsafe { &(*name).content });
            return Err(self.runtime_error(&message));
        };
        self.call_closure(as_closure_object(&method), argument_count)
    }

    fn bind_method(&mut self, class: *mut ObjectClass, name: *mut ObjectString) -> InterpretResult {
        let Some(method) = (unsafe { (*class).methods.get(name) }) else {
            let message = format!("Undefined property '{}'.", unsafe { &(*name).content });
            return Err(self.runtime_error(&message));
        };

        self.maybe_collect();
        let receiver = self.peek_steps(0);
        let (bound, _size) = self
            .object_manager
            .alloc_bound_method(receiver, as_closure_object(&method));
        self.pop();
        self.push(make_object_value(bound as *mut Object))
    }

    // Reuse an existing open upvalue for the slot, or insert a fresh one
    // keeping the list sorted by descending slot address.
    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjectUpvalue {
        let location = &mut self.stack[slot] as *mut Value;

        let mut insert_at = self.open_upvalues.len();
        for (index, &upvalue) in self.open_upvalues.iter().enumerate() {
            let existing = unsafe { (*upvalue).location };
            if existing == location {
                return upvalue;
            }
            if (existing as usize) < (location as usize) {
                insert_at = index;
                break;
            }
        }

        self.maybe_collect();
        let (upvalue, _size) = self.object_manager.alloc_upvalue(location);
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    // Close every open upvalue at or above the given slot: the stack value
    // moves into the upvalue and the list entry is dropped.
    fn close_upvalues(&mut self, last_slot: usize) {
        let last = &mut self.stack[last_slot] as *mut Value;
        while let Some(&upvalue) = self.open_upvalues.first() {
            let location = unsafe { (*upvalue).location };
            if (location as usize) < (last as usize) {
                break;
            }
            unsafe { (*upvalue).close() };
            self.open_upvalues.remove(0);
        }
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn trace_instruction(vm: &VM) {
        print!("{: >10}", "");
        for slot in &vm.stack[0..vm.stack_top_pos] {
            print!(" [ {} ]", format_value(slot));
        }
        println!();
        let frame = vm.frames.last().expect("No call frame.");
        let chunk = unsafe { &(*(*frame.closure).function).chunk };
        debug::disassemble_instruction(chunk, frame.ip);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    pub fn trace_instruction(_vm: &super::VM) {}
}
