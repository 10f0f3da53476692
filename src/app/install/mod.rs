pub mod driver;
pub mod markers;
pub mod process;
pub mod queue;
pub mod runner;
pub mod task;
