//! Voltage logger firmware for RP2350A
//!
//! Samples ADC0 once per cycle and stores readings on an SPI SD card.
//! Commands arrive on UART0 (115200 baud), responses go to the defmt log.

#![no_std]
#![no_main]

use core::fmt::Write;

use defmt::{debug, error, info, warn};
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_rp::adc::{self, Adc};
use embassy_rp::bind_interrupts;
use embassy_rp::gpio::{Level, Output, Pull};
use embassy_rp::peripherals::{SPI1, UART0};
use embassy_rp::spi;
use embassy_rp::uart::{BufferedUart, BufferedUartRx, Config as UartConfig};
use embassy_rp::watchdog::Watchdog;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::delay::DelayNs;
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_io_async::Read;
use embedded_sdmmc::SdCard;
use heapless::String;
use static_cell::StaticCell;

use sensor_logger::clock::{elapsed_ms, Clock, DateTime};
use sensor_logger::command::{Command, CommandParser};
use sensor_logger::config::*;
use sensor_logger::mailbox::Mailbox;
use sensor_logger::record::display_hex;
use sensor_logger::scheduler::{Scheduler, Task};
use sensor_logger::sdmmc::{ClockTimeSource, SdCardController, SdmmcVolume, SharedCard};
use sensor_logger::{
    ConfigDocument, MediumController, MediumState, Status, StorageError, StorageSubsystem,
};

use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(struct Irqs {
    UART0_IRQ => embassy_rp::uart::BufferedInterruptHandler<UART0>;
});

/// uart_rx_task → command task
static COMMANDS: Mailbox<CriticalSectionRawMutex> = Mailbox::new();

// ============================================================================
// Board time and delays
// ============================================================================

/// 2025-01-01 00:00:00 UTC; the board has no RTC, calendar time is uptime
/// on top of this base.
const UPTIME_EPOCH: u32 = 1_735_689_600;

#[derive(Clone, Copy)]
struct UptimeClock;

impl Clock for UptimeClock {
    fn now(&self) -> DateTime {
        DateTime::from_unix(UPTIME_EPOCH.wrapping_add(Instant::now().as_secs() as u32))
    }

    fn monotonic_ms(&self) -> u32 {
        Instant::now().as_millis() as u32
    }
}

/// Busy-wait delay for the SD stack; the settling waits must not yield
/// mid-recovery.
struct CortexMDelay;

impl DelayNs for CortexMDelay {
    fn delay_ns(&mut self, ns: u32) {
        // At 150 MHz (RP2350), ~6.67 ns per cycle
        let cycles = ns / 7 + 1;
        cortex_m::asm::delay(cycles);
    }
}

type SdSpi = spi::Spi<'static, SPI1, spi::Blocking>;
type SdSpiDev = ExclusiveDevice<SdSpi, Output<'static>, CortexMDelay>;
type Card = SdCard<SdSpiDev, CortexMDelay>;
type SdVolume = SdmmcVolume<SharedCard<SdSpiDev, CortexMDelay>, ClockTimeSource<UptimeClock>>;
type SdController = SdCardController<SdSpiDev, CortexMDelay, fn(&mut SdSpiDev, u32)>;
type Storage = StorageSubsystem<SdVolume, SdController, CortexMDelay, UptimeClock>;

fn set_spi_frequency(dev: &mut SdSpiDev, hz: u32) {
    dev.bus_mut().set_frequency(hz);
}

// ============================================================================
// Entry point
// ============================================================================

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    info!("Sensor logger starting...");

    // ── Watchdog ──────────────────────────────────────────────────────
    let mut watchdog = Watchdog::new(p.WATCHDOG);
    watchdog.start(Duration::from_secs(WATCHDOG_TIMEOUT_S));

    // ── SPI + SD card ─────────────────────────────────────────────────
    let mut spi_config = spi::Config::default();
    spi_config.frequency = SD_SPI_INIT_FREQ;
    let spi1 = spi::Spi::new_blocking(p.SPI1, p.PIN_10, p.PIN_11, p.PIN_12, spi_config);
    let cs = Output::new(p.PIN_13, Level::High);

    let Ok(spi_device) = ExclusiveDevice::new(spi1, cs, CortexMDelay) else {
        error!("Failed to create SPI device, watchdog reboot in 5s...");
        loop {
            Timer::after(Duration::from_secs(1)).await;
        }
    };

    static SD_CARD: StaticCell<Card> = StaticCell::new();
    let card: &'static Card = SD_CARD.init(SdCard::new(spi_device, CortexMDelay));

    let mut controller: SdController = SdCardController::new(card, set_spi_frequency);
    for attempt in 1..=CARD_INIT_RETRIES {
        watchdog.feed();
        info!("SD init attempt {}/{}...", attempt, CARD_INIT_RETRIES);
        match controller.init_card() {
            Ok(()) => break,
            Err(e) => {
                warn!("SD init failed: {:?}", e);
                Timer::after(Duration::from_millis(500)).await;
            }
        }
    }

    let volume = SdmmcVolume::new(SharedCard(card), ClockTimeSource(UptimeClock));
    let mut storage: Storage = StorageSubsystem::new(volume, controller, CortexMDelay, UptimeClock);
    watchdog.feed();
    match storage.init() {
        Ok(()) => info!("Storage ready, boot {}", storage.boot_count()),
        // keep running: writes trigger recovery once a card shows up
        Err(e) => error!("Storage init failed: {:?}", e),
    }
    let doc = load_config(&mut storage);
    log_event(&mut storage, format_args!("system init"));

    // ── UART0 ─────────────────────────────────────────────────────────
    static TX_BUF: StaticCell<[u8; 32]> = StaticCell::new();
    static RX_BUF: StaticCell<[u8; UART_RX_BUF_SIZE]> = StaticCell::new();
    let tx_buf = &mut TX_BUF.init([0; 32])[..];
    let rx_buf = &mut RX_BUF.init([0; UART_RX_BUF_SIZE])[..];
    let mut uart_config = UartConfig::default();
    uart_config.baudrate = UART_BAUDRATE;
    let uart = BufferedUart::new(p.UART0, p.PIN_0, p.PIN_1, Irqs, tx_buf, rx_buf, uart_config);
    let (_uart_tx, uart_rx) = uart.split();

    // ── ADC ───────────────────────────────────────────────────────────
    let adc = Adc::new_blocking(p.ADC, adc::Config::default());
    let channel = adc::Channel::new_pin(p.PIN_26, Pull::None);

    let device = Device {
        storage,
        adc,
        channel,
        watchdog,
        commands: CommandParser::new(),
        sampling: false,
        cycle_s: DEFAULT_SAMPLE_CYCLE_S,
        last_sample_ms: 0,
        ratio: doc.ratio_or_default(),
        limit: doc.limit_or_default(),
        last_state: MediumState::Unknown,
    };

    spawner.must_spawn(uart_rx_task(uart_rx));
    spawner.must_spawn(scheduler_task(device));
    info!("All tasks spawned");
}

fn load_config(storage: &mut Storage) -> ConfigDocument {
    let doc = match storage.read_config() {
        Err(StorageError::NotFound) => {
            info!("config.ini not found, writing sample config");
            if storage.create_sample_config() != Status::Ok {
                warn!("Failed to write sample config");
            }
            storage.read_config()
        }
        other => other,
    };
    match doc {
        Ok(doc) if doc.valid => {
            info!("Config: ratio={} limit={}", doc.ratio, doc.limit);
            doc
        }
        Ok(_) => {
            warn!("config.ini incomplete, using defaults");
            ConfigDocument::invalid()
        }
        Err(e) => {
            warn!("Cannot read config.ini: {:?}, using defaults", e);
            ConfigDocument::invalid()
        }
    }
}

// ============================================================================
// UART RX task: the receive context, hands idle-delimited frames over
// ============================================================================

#[embassy_executor::task]
async fn uart_rx_task(mut rx: BufferedUartRx) {
    info!("uart_rx_task started");

    let mut frame = [0u8; UART_RX_BUF_SIZE];
    let mut len = 0usize;
    let mut chunk = [0u8; 32];

    loop {
        match select(
            rx.read(&mut chunk),
            Timer::after(Duration::from_millis(UART_IDLE_MS)),
        )
        .await
        {
            Either::First(Ok(n)) => {
                let take = n.min(frame.len() - len);
                frame[len..len + take].copy_from_slice(&chunk[..take]);
                len += take;
            }
            Either::First(Err(e)) => {
                warn!("UART read error: {:?}", e);
                Timer::after(Duration::from_millis(10)).await;
            }
            Either::Second(()) if len > 0 => {
                if COMMANDS.publish(&frame[..len], || len = 0).is_err() {
                    warn!("Command frame dropped ({} total)", COMMANDS.dropped());
                }
            }
            Either::Second(()) => {}
        }
    }
}

// ============================================================================
// Scheduler task: sampling, commands and housekeeping, one at a time
// ============================================================================

struct Device {
    storage: Storage,
    adc: Adc<'static, adc::Blocking>,
    channel: adc::Channel<'static>,
    watchdog: Watchdog,
    commands: CommandParser,
    sampling: bool,
    cycle_s: u32,
    last_sample_ms: u32,
    ratio: f32,
    limit: f32,
    last_state: MediumState,
}

#[embassy_executor::task]
async fn scheduler_task(mut device: Device) {
    let mut scheduler: Scheduler<Device, MAX_TASKS> = Scheduler::new();
    let tasks = [
        Task::new("sample", SAMPLE_TASK_PERIOD_MS, sample_task),
        Task::new("command", COMMAND_TASK_PERIOD_MS, command_task),
        Task::new("housekeeping", HOUSEKEEPING_TASK_PERIOD_MS, housekeeping_task),
    ];
    for task in tasks {
        if let Err(e) = scheduler.add(task) {
            error!("Scheduler: {:?}", e);
        }
    }

    loop {
        scheduler.run_pass(&UptimeClock, &mut device);
        device.watchdog.feed();
        Timer::after(Duration::from_millis(1)).await;
    }
}

fn sample_task(dev: &mut Device) {
    if !dev.sampling {
        return;
    }
    let now = UptimeClock.monotonic_ms();
    if elapsed_ms(now, dev.last_sample_ms) < dev.cycle_s * 1000 {
        return;
    }
    dev.last_sample_ms = now;

    let raw = match dev.adc.blocking_read(&mut dev.channel) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("ADC read failed: {:?}", e);
            return;
        }
    };
    let voltage = f32::from(raw) * ADC_VREF / ADC_FULL_SCALE * dev.ratio;

    if dev.storage.hidden_mode() {
        let (whole, frac) = display_hex(voltage);
        let mut hex: String<8> = String::new();
        if write!(hex, "{:04X}{:04X}", whole, frac).is_ok() {
            info!("{}", hex.as_str());
        }
    } else {
        info!("{} ch0={}V", UptimeClock.now(), voltage);
    }
    if voltage > dev.limit {
        warn!("Over limit: {}V > {}V", voltage, dev.limit);
    }

    let status = dev.storage.record_measurement(voltage, dev.limit);
    if status != Status::Ok {
        warn!("Measurement not stored: {:?}", status);
    }
}

fn log_event(storage: &mut Storage, args: core::fmt::Arguments<'_>) {
    let mut text: String<64> = String::new();
    if text.write_fmt(args).is_err() {
        warn!("Log text too long");
        return;
    }
    if storage.write_log(&text) != Status::Ok {
        warn!("Log record not stored");
    }
}

fn command_task(dev: &mut Device) {
    let Some(frame) = COMMANDS.take() else {
        return;
    };
    let Some(command) = dev.commands.feed(&frame) else {
        return;
    };
    debug!("Command: {:?}", command);

    match command {
        Command::Start => {
            dev.sampling = true;
            log_event(
                &mut dev.storage,
                format_args!("sample start - cycle {}s (command)", dev.cycle_s),
            );
        }
        Command::Stop => {
            dev.sampling = false;
            log_event(&mut dev.storage, format_args!("sample stop (command)"));
        }
        Command::Hide => {
            dev.storage.set_hidden_mode(true);
            log_event(&mut dev.storage, format_args!("hide data"));
        }
        Command::Unhide => {
            dev.storage.set_hidden_mode(false);
            log_event(&mut dev.storage, format_args!("unhide data"));
        }
        Command::SelfTest => self_test(&mut dev.storage),
        Command::ShowConfig => match dev.storage.read_config() {
            Ok(doc) if doc.valid => {
                info!("Ratio= {}", doc.ratio);
                info!("Limit= {}", doc.limit);
                dev.ratio = doc.ratio;
                dev.limit = doc.limit;
                log_event(&mut dev.storage, format_args!("config check (command)"));
            }
            Err(StorageError::NotFound) => error!("config.ini not found"),
            _ => error!("config.ini parse error"),
        },
        Command::AskRatio => match dev.storage.read_config() {
            Ok(doc) if doc.valid => {
                info!("Ratio={}", doc.ratio);
                info!("Input value(0-100):");
                log_event(&mut dev.storage, format_args!("ratio config"));
            }
            _ => {
                error!("Cannot read config.ini");
                dev.commands.cancel_prompt();
            }
        },
        Command::AskLimit => match dev.storage.read_config() {
            Ok(doc) if doc.valid => {
                info!("Limit={}", doc.limit);
                info!("Input value(0-200):");
                log_event(&mut dev.storage, format_args!("limit config"));
            }
            _ => {
                error!("Cannot read config.ini");
                dev.commands.cancel_prompt();
            }
        },
        Command::SetRatio(value) => {
            match value.map(|v| (v, dev.storage.write_ratio(v))) {
                Some((v, Status::Ok)) => {
                    dev.ratio = v;
                    info!("ratio modified success, Ratio={}", v);
                    log_event(&mut dev.storage, format_args!("ratio config success to {:.2}", v));
                }
                _ => info!("ratio invalid, Ratio={}", dev.ratio),
            }
        }
        Command::SetLimit(value) => {
            match value.map(|v| (v, dev.storage.write_limit(v))) {
                Some((v, Status::Ok)) => {
                    dev.limit = v;
                    info!("Limit modified success, Limit={}", v);
                    log_event(&mut dev.storage, format_args!("limit config success to {:.2}", v));
                }
                _ => info!("Limit invalid, Limit={}", dev.limit),
            }
        }
    }
}

fn self_test(storage: &mut Storage) {
    log_event(storage, format_args!("system hardware test"));
    info!("====system selftest====");
    match storage.medium_info() {
        Ok(medium) => {
            info!("TF card......ok");
            info!("TF card memory: {} KB", medium.capacity_mib * 1024);
            log_event(storage, format_args!("test ok"));
        }
        Err(StorageError::NotFound) => {
            info!("TF card......error, can not find TF card");
            log_event(storage, format_args!("test error: tf card not found"));
        }
        Err(_) => {
            info!("ERROR");
            log_event(storage, format_args!("test error: unknown"));
        }
    }
    if let Ok(report) = storage.diagnose() {
        info!("{} files, {} directories", report.files, report.dirs);
    }
    info!("====system selftest====");
}

fn housekeeping_task(dev: &mut Device) {
    let state = dev.storage.medium_state();
    if state != dev.last_state {
        info!("Medium state {:?} -> {:?}", dev.last_state, state);
        dev.last_state = state;
    }
    // gated by the same cooldown and lockout as write-path recovery
    if state == MediumState::Degraded {
        if let Err(e) = dev.storage.recover() {
            debug!("Background recovery not run: {:?}", e);
        }
    }
}
