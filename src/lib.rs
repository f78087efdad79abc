pub mod cpu;
pub mod loader;
pub mod frontend;
pub mod backend;
pub mod instructions;
pub mod memory_subsystem;
