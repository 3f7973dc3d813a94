pub const MAX_FRAMES: usize = 64;
pub const MAX_STACK_SIZE: usize = MAX_FRAMES * 256;

pub const GC_HEAP_GROW_FACTOR: usize = 2;
pub const GC_FIRST_TRIGGER: usize = 1024 * 1024;
