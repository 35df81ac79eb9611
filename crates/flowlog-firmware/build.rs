//! Bakes deployment settings into the firmware.
//!
//! Values come from the process environment or a `.env` file next to this
//! crate (see `.env.example`). They are written to `$OUT_DIR/deployment.rs`
//! and included by `flowlog_firmware::deployment`.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// Setting name, default when unset
const STRINGS: &[(&str, &str)] = &[
    ("FTP_HOST", ""),
    ("FTP_USERNAME", ""),
    ("FTP_PASSWORD", ""),
    ("FTP_DATA_PATH", "/"),
    ("FTP_LOG_PATH", "/"),
    ("APN_NAME", ""),
    ("APN_USERNAME", ""),
    ("APN_PASSWORD", ""),
];

fn main() {
    println!("cargo:rerun-if-changed=.env");
    match dotenvy::dotenv() {
        Ok(path) => println!("cargo:rerun-if-changed={}", path.display()),
        Err(e) if e.not_found() => println!("cargo:warning=no .env file, using the environment only"),
        Err(e) => panic!("unreadable .env file: {e}"),
    }

    let mut out = String::new();

    let unit_id: u8 = number("UNIT_ID", "20", |id| id < 100, "a number below 100");
    writeln!(out, "pub const UNIT_ID: u8 = {unit_id};").unwrap();

    let port: u16 = number("FTP_PORT", "21", |port| port != 0, "a port number from 1 to 65535");
    writeln!(out, "pub const FTP_PORT: u16 = {port};").unwrap();

    for (name, default) in STRINGS {
        let value = setting(name, default);
        if value.is_empty() {
            println!("cargo:warning=FLOWLOG_{name} is not set");
        }
        writeln!(out, "pub const {name}: &str = {value:?};").unwrap();
    }

    let dest = PathBuf::from(env::var_os("OUT_DIR").unwrap()).join("deployment.rs");
    fs::write(dest, out).unwrap();
}

fn setting(name: &str, default: &str) -> String {
    let key = format!("FLOWLOG_{name}");
    println!("cargo:rerun-if-env-changed={key}");
    env::var(&key).unwrap_or_else(|_| default.to_string())
}

/// Numeric setting that must parse and pass `valid`, else the build stops.
fn number<T: std::str::FromStr + Copy>(
    name: &str,
    default: &str,
    valid: impl Fn(T) -> bool,
    expected: &str,
) -> T {
    let raw = setting(name, default);
    match raw.parse::<T>() {
        Ok(value) if valid(value) => value,
        _ => panic!("FLOWLOG_{name} must be {expected}, got '{raw}'"),
    }
}
