//! # perfmon-types
//!
//! Data objects produced by the perfmon engine and handed to appenders.
//! Nothing in here knows how the data was collected; these are the
//! boundary types that sinks persist, print or forward.
//!
//! ## Design Goals
//!
//! - **Zero required dependencies**: Core types work without any serialization framework
//! - **Optional serialization**: Enable `serde` and/or `minicbor` features as needed
//! - **Immutable snapshots**: An [`IntervalData`] never changes after the interval closes
//!
//! ## Features
//!
//! - `std` (default): Standard library support
//! - `serde`: JSON/MessagePack/etc. serialization via serde
//! - `minicbor`: Compact binary serialization via CBOR
//! - `all`: Enable all serialization formats
//!
//! ## Example
//!
//! ```rust
//! use perfmon_types::{IntervalData, Microseconds, ThreadTraceData};
//!
//! let interval = IntervalData::builder("WebRequest.login")
//!     .window(1_703_160_000_000, 1_703_160_060_000)
//!     .hits(120)
//!     .completions(118)
//!     .total_duration(Microseconds::from_millis(11_800))
//!     .build();
//!
//! assert_eq!(interval.average_duration_ms(), 100.0);
//!
//! let mut trace = ThreadTraceData::open("WebRequest", 1_703_160_000_000);
//! trace.close(1_703_160_000_250);
//! assert_eq!(trace.duration_ms(), Some(250));
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod duration;
mod interval;
mod stats;
mod trace;

pub use duration::*;
pub use interval::*;
pub use stats::*;
pub use trace::*;

/// Get current timestamp in milliseconds since Unix epoch.
#[cfg(feature = "std")]
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
