pub mod checker;
pub mod config;
pub mod mapping;
pub mod upstream;
