//! Flow meter pulse input

use embassy_time::{Duration, Instant, with_timeout};
use esp_hal::gpio::Input;
use log::{debug, info};

use flowlog_core::PulseAccumulator;

fn now_ms() -> u32 {
    Instant::now().as_millis() as u32
}

/// Count closures of the meter's reed contact.
///
/// Every closure is reported as a candidate. If the contact opens again
/// inside the minimum pulse width the opening is reported too and cancels
/// it; otherwise the candidate is settled once the width has elapsed.
#[embassy_executor::task]
pub async fn pulse_task(mut input: Input<'static>, pulses: &'static PulseAccumulator) {
    info!("Pulse input task started");
    let width = Duration::from_millis(u64::from(pulses.min_pulse_width_ms()));

    loop {
        input.wait_for_falling_edge().await;
        pulses.on_edge(now_ms());

        match with_timeout(width, input.wait_for_rising_edge()).await {
            Ok(()) => {
                let opened = now_ms();
                if !pulses.on_edge(opened) {
                    debug!("Closure released at {} ms rejected as noise", opened);
                }
            }
            Err(_) => {
                pulses.settle(now_ms());
                input.wait_for_rising_edge().await;
            }
        }
    }
}
