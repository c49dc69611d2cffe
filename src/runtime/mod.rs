//! Async store handle, conflict retry, and background journaling.

/// Event stream types emitted by the runtime.
pub mod events;
/// Handle and persistence worker implementation.
pub mod handle;
