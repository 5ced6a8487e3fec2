//! Test modules for the shared crate

mod capabilities_tests;
mod tasks_tests;
mod utils_tests;
