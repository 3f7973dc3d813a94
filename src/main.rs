use std::alloc::{GlobalAlloc, Layout, System};
use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

use flint::vm::{InterpretError, VM};

// Out of memory is fatal with exit status 1, not an abort. Wrapping the
// system allocator is the stable way to intercept the failure before the
// default handler runs.
struct ExitOnOom;

#[global_allocator]
static ALLOCATOR: ExitOnOom = ExitOnOom;

fn out_of_memory() -> ! {
    // This path must not allocate.
    let mut stderr = io::stderr();
    let _ = stderr.write_all(b"Out of memory.\n");
    process::exit(1);
}

unsafe impl GlobalAlloc for ExitOnOom {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if ptr.is_null() && layout.size() > 0 {
            out_of_memory();
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if ptr.is_null() && layout.size() > 0 {
            out_of_memory();
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if new_ptr.is_null() && new_size > 0 {
            out_of_memory();
        }
        new_ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
    }
}

fn repl(vm: &mut VM) {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush().expect("Failed to flush stdout");

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                // Each line stands alone; errors only affect this line.
                let _ = vm.interpret(&line);
            }
            Err(_) => break,
        }
    }
}

fn run_file(vm: &mut VM, path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}.", path, err);
            process::exit(74);
        }
    };

    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(65),
        Err(InterpretError::Runtime) => process::exit(70),
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut vm = VM::new();

    match args.len() {
        1 => repl(&mut vm),
        2 => run_file(&mut vm, &args[1]),
        _ => {
            eprintln!("Usage: flint [path]");
            process::exit(64);
        }
    }
}
