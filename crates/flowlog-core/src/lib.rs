//! Hardware-independent core library for flowlog
//!
//! This crate contains all platform-agnostic logic for the flowlog pulse
//! logger: debounced pulse counting, the snapshot/upload schedule, data file
//! sequencing, the cellular link state machine, the FTP transfer client and
//! the orchestrator that ties them together.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod battery;
pub mod config;
pub mod filename;
pub mod modem;
pub mod orchestrator;
pub mod pulse;
pub mod schedule;
pub mod storage;
pub mod text;
pub mod time;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use config::{Config, UnitId};
pub use orchestrator::UploadOrchestrator;
pub use pulse::{PulseAccumulator, Reading};
pub use time::DateTime;
