#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{Config as UartConfig, Uart};
use log::{LevelFilter, info, warn};
use static_cell::StaticCell;

use flowlog_core::modem::{LinkController, PowerKey};
use flowlog_core::storage::sd_card::SdCardStorage;
use flowlog_core::{PulseAccumulator, UploadOrchestrator};
use flowlog_firmware::battery_adc::AdcBattery;
use flowlog_firmware::deployment;
use flowlog_firmware::logger::{self, DEBUG_LOG};
use flowlog_firmware::modem_uart::{MODEM_BAUDRATE, UartTransport};
use flowlog_firmware::pulse_input::pulse_task;
use flowlog_firmware::soft_clock::SoftClock;

/// Ticks run several times a minute; the schedule acts once per minute
const TICK_INTERVAL: Duration = Duration::from_secs(15);

static CLOCK: SoftClock = SoftClock::new();
static PULSES: StaticCell<PulseAccumulator> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    logger::init(LevelFilter::Info);

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized");

    let config = deployment::config().expect("Invalid deployment settings");
    info!("Unit {} uploading to {}:{}", config.unit_id, config.ftp.host, config.ftp.port);

    // Pulse input: reed contact to ground, internal pull-up
    let pulses: &'static PulseAccumulator =
        PULSES.init(PulseAccumulator::new(config.min_pulse_width_ms));
    let meter = Input::new(
        peripherals.GPIO4,
        InputConfig::default().with_pull(Pull::Up),
    );
    spawner.must_spawn(pulse_task(meter, pulses));

    // Modem: UART1 plus power key and status line
    let uart = Uart::new(
        peripherals.UART1,
        UartConfig::default().with_baudrate(MODEM_BAUDRATE),
    )
    .expect("Failed to configure modem UART")
    .with_tx(peripherals.GPIO17)
    .with_rx(peripherals.GPIO18)
    .into_async();
    let power_key = Output::new(peripherals.GPIO5, Level::High, OutputConfig::default());
    let status = Input::new(peripherals.GPIO6, InputConfig::default());
    let power = PowerKey::new(power_key, status, Delay);
    let link = LinkController::new(UartTransport::new(uart), power, Delay, &config);

    // SD card on SPI3
    let spi_bus = Spi::new(
        peripherals.SPI3,
        SpiConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .expect("Failed to configure SD card SPI")
    .with_sck(peripherals.GPIO40)
    .with_mosi(peripherals.GPIO38)
    .with_miso(peripherals.GPIO39);
    let sd_cs = Output::new(peripherals.GPIO47, Level::High, OutputConfig::default());
    let sd_device =
        ExclusiveDevice::new(spi_bus, sd_cs, Delay).expect("Failed to set up SD card device");
    let sd_card = embedded_sdmmc::SdCard::new(sd_device, Delay);
    let storage = SdCardStorage::new(sd_card, &CLOCK);

    // Battery divider on GPIO1
    let battery = AdcBattery::new(peripherals.ADC1, peripherals.GPIO1);

    let mut orchestrator = UploadOrchestrator::new(&config, pulses, storage, &CLOCK, link, battery)
        .expect("Configuration rejected")
        .with_debug_log(&DEBUG_LOG);

    if let Some(window) = orchestrator.start().await {
        info!("Boot window finished, link {:?}", window.link);
    }
    if CLOCK.read().is_none() {
        warn!("Clock not set after boot, readings wait for network time");
    }

    loop {
        let report = orchestrator.tick().await;
        if let Some(sealed) = &report.sealed {
            info!("Sealed {}", sealed);
        }
        if let Some(window) = &report.window {
            info!(
                "Upload window: {} finished, {} succeeded, {} queued",
                window.finished.len(),
                window.succeeded().count(),
                orchestrator.backlog().len()
            );
        }
        Timer::after(TICK_INTERVAL).await;
    }
}
