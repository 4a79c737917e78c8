pub mod config;
pub mod error;
pub mod events;
pub mod prompt;
pub mod session;
