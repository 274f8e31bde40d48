//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one part of the
//! transport against mock adapters. All tests run on the host (x86_64)
//! with no radio required.

mod lifecycle_tests;
mod mocks;
mod negotiation_tests;
mod reassembly_tests;
mod worker_tests;
