// Library exports for ai-ops
// This allows the modules to be imported in tests and external code

pub mod config;
pub mod error;
pub mod persistence;
pub mod planning;
pub mod session;
pub mod tools;
pub mod utils;

pub use error::{Error, Result};
