pub mod config;
pub mod console;
