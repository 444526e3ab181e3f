//! Testing utilities for deskgate pipelines.
//!
//! Fixture stages run real child processes (`sleep`, `sh`, `python3`), so
//! tests exercise the same spawn, probe and teardown paths as production.

mod fixtures;

pub use fixtures::{counting_crasher, free_port, listener, pid_running, sleeper, spawn_count};
