pub mod compaction;
pub mod interrupt;
pub mod parser;
pub mod sandbox;
pub mod stack;
pub mod task_loop;
