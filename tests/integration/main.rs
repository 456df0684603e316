//! Integration tests for the plan/execution engine
//!
//! Tools are stand-ins built from descriptors around `echo`, `sleep`, `sh`
//! and friends, so the suite runs without any pentest binaries installed.

mod cancellation_tests;
mod common;
mod engine_tests;
mod registry_tests;
mod session_tests;
