//! Integration test modules.

mod control_engine_test;
mod known_devices_test;
mod link_state_test;
mod session_recorder_test;
