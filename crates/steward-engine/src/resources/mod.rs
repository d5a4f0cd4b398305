//! Built-in resource kinds.

mod noop;
mod timer;

pub use noop::{NoopParams, NoopRes};
pub use timer::{TimerParams, TimerRes};
