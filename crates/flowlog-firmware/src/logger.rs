//! Logger writing to RTT and queueing lines for the card
//!
//! Every record goes to the RTT channel. Records at `Info` and above are
//! also queued in [`DEBUG_LOG`], which the orchestrator appends to the
//! debug log file after each tick.

use log::{LevelFilter, Log, Metadata, Record};

use flowlog_core::storage::DebugLog;

pub static DEBUG_LOG: DebugLog = DebugLog::new();

/// Most verbose level mirrored to the card
const CARD_LEVEL: LevelFilter = LevelFilter::Info;

struct FlowLogger;

static LOGGER: FlowLogger = FlowLogger;

impl Log for FlowLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        rtt_target::rprintln!("{:<5} {}: {}", record.level(), record.target(), record.args());
        if record.level() <= CARD_LEVEL {
            DEBUG_LOG.push(record);
        }
    }

    fn flush(&self) {}
}

/// Set up the RTT channel and install the logger. Call once, first thing.
pub fn init(level: LevelFilter) {
    rtt_target::rtt_init_print!();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
