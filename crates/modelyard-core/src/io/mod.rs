//! Drive-aware I/O throttling.

mod throttle;

pub use throttle::{IoPermit, IoThrottle};
