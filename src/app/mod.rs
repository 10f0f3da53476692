pub mod commands;
pub mod config;
pub mod credentials;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod install;
pub mod log_sink;
pub mod logging;
pub mod models;
pub mod process;
pub mod services;
pub mod state;
