pub mod config;
pub mod streams;

pub use config::*;
pub use streams::*;
