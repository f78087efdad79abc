pub mod backend;
pub mod physical_register;
pub mod register_alias_table;
pub mod reorder_buffer;
pub mod issue_queue;
pub mod execution_unit;
pub mod branch_instruction_stack;
