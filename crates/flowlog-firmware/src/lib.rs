//! ESP32-S3 firmware-specific modules for flowlog
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: the modem UART transport, the pulse input task, the software
//! wall clock, the battery ADC, the RTT logger and the deployment settings
//! baked in at build time.

#![no_std]

extern crate alloc;

pub mod battery_adc;
pub mod deployment;
pub mod logger;
pub mod modem_uart;
pub mod pulse_input;
pub mod soft_clock;
