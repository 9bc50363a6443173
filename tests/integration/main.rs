//! Integration test harness: full subsystem stacks against simulated
//! hardware and a simulated clock.

mod dispatch_tests;
mod engine_tests;
mod mock_hw;
mod registry_tests;
