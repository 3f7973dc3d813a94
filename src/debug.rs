use crate::chunk::{Chunk, OpCode};
use crate::value::{as_function_object, print_value};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:08} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("       | ");
    } else {
        print!("{:08} ", chunk.lines[offset]);
    }

    let instruction = OpCode::from_byte(chunk.code[offset]);
    let name = OpCode::byte_to_string(&instruction);
    match instruction {
        Some(op) if matches!(
            op,
            OpCode::Constant
                | OpCode::DefineGlobal
                | OpCode::GetGlobal
                | OpCode::SetGlobal
                | OpCode::GetProperty
                | OpCode::SetProperty
                | OpCode::Class
                | OpCode::Method
        ) =>
        {
            constant_instruction(&name, chunk, offset)
        }
        Some(op) if matches!(
            op,
            OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetUpvalue
                | OpCode::SetUpvalue
                | OpCode::Call
        ) =>
        {
            byte_instruction(&name, chunk, offset)
        }
        Some(op) if matches!(op, OpCode::Jump | OpCode::JumpIfFalse) => {
            jump_instruction(&name, 1, chunk, offset)
        }
        Some(OpCode::Loop) => jump_instruction(&name, -1, chunk, offset),
        Some(OpCode::Invoke) => invoke_instruction(&name, chunk, offset),
        Some(OpCode::Closure) => closure_instruction(chunk, offset),
        Some(_) => simple_instruction(&name, offset),
        None => {
            println!("Unknown opcode {}", chunk.code[offset]);
            offset + 1
        }
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{}", name);
    offset + 1
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    print!("{:<16} {:>4} '", name, constant);
    print_value(chunk.get_constant(constant as usize));
    println!("'");
    offset + 2
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:>4}", name, slot);
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let mut jump_offset = (chunk.code[offset + 1] as u16) << 8;
    jump_offset |= chunk.code[offset + 2] as u16;

    let signed_jump = (sign as isize) * (jump_offset as isize);
    let target = (offset as isize + 3 + signed_jump) as usize;

    println!("{:<16} {:>4} -> {}", name, offset, target);
    offset + 3
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    print!("{:<16} ({} args) {:>4} '", name, arg_count, constant);
    print_value(chunk.get_constant(constant as usize));
    println!("'");
    offset + 3
}

// Variable length: the constant operand is followed by one (is_local, index)
// byte pair per captured upvalue.
fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset];
    offset += 1;
    print!("{:<16} {:>4} ", "Closure", constant);
    print_value(chunk.get_constant(constant as usize));
    println!();

    let function = as_function_object(chunk.get_constant(constant as usize));
    let upvalue_count = unsafe { (*function).upvalue_count };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:08}      |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_manager::ObjectManager;
    use crate::value::{make_function_value, make_number_value};

    #[test]
    fn offsets_are_increasing_and_cover_the_chunk() {
        let mut manager = ObjectManager::new();
        let (function, _) = manager.alloc_function(0, "inner".to_string());
        unsafe { (*function).upvalue_count = 1 };

        let mut chunk = Chunk::new();
        let number = chunk.add_constant(make_number_value(1.0)) as u8;
        let inner = chunk.add_constant(make_function_value(function)) as u8;

        chunk.write(OpCode::Constant.to_byte(), 1);
        chunk.write(number, 1);
        chunk.write(OpCode::GetLocal.to_byte(), 1);
        chunk.write(0, 1);
        chunk.write(OpCode::Jump.to_byte(), 2);
        chunk.write(0, 2);
        chunk.write(3, 2);
        chunk.write(OpCode::Loop.to_byte(), 2);
        chunk.write(0, 2);
        chunk.write(5, 2);
        chunk.write(OpCode::Closure.to_byte(), 3);
        chunk.write(inner, 3);
        chunk.write(1, 3); // captures a local
        chunk.write(0, 3); // slot index
        chunk.write(OpCode::Invoke.to_byte(), 4);
        chunk.write(number, 4);
        chunk.write(0, 4);
        chunk.write(OpCode::Return.to_byte(), 4);

        let mut offsets = vec![];
        let mut offset = 0;
        while offset < chunk.len() {
            offsets.push(offset);
            let next = disassemble_instruction(&chunk, offset);
            assert!(next > offset, "offsets must strictly increase");
            offset = next;
        }
        assert_eq!(offset, chunk.len());
        assert_eq!(offsets, vec![0, 2, 4, 7, 10, 14, 17]);
    }
}
