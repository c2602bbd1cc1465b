//! Statistical calculators attached to monitors.
//!
//! Both calculators are cheap to clone; a monitor that inherits a calculator
//! from an ancestor or an appender gets its own copy with zeroed counters.

mod median;
mod threshold;

pub use median::{MedianCalculator, DEFAULT_FACTOR, DEFAULT_MAX_ELEMENTS};
pub use threshold::ThresholdCalculator;
