pub mod memory_subsystem;
pub mod load_store_queue;
