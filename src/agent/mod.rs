pub mod config;
pub mod daemon;
pub mod doctor;
pub mod tools;
