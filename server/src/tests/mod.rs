//! Test modules for the scheduler server


mod cache_tests;
mod dispatch_tests;
mod lease_tests;
mod output_tests;
