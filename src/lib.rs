pub mod bits;
pub mod disasm;
pub mod expr;
pub mod insn;
pub mod ispec;
pub mod loader;
pub mod mapper;
pub mod mem;
pub mod render;
