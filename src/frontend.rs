pub mod frontend;
pub mod branch_target_buffer;
