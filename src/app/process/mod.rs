pub mod control;
pub mod poll;
pub mod runner;
