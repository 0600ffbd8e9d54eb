//! Configuration constants for the sensor logger

// ── File rotation ──────────────────────────────────────────────────────────

/// Records written to one file before a new file name is generated
pub const RECORDS_PER_FILE: u16 = 10;

// ── Medium recovery ────────────────────────────────────────────────────────

/// Minimum spacing between two recovery attempts
pub const RECOVERY_COOLDOWN_MS: u32 = 2_000;

/// Refuse recovery for this long once the failure limit is reached
pub const RECOVERY_LOCKOUT_MS: u32 = 10_000;

/// Consecutive failed recoveries before the lockout kicks in
pub const MAX_CONSECUTIVE_FAILURES: u8 = 3;

/// Card re-probe attempts inside one recovery
pub const CARD_INIT_RETRIES: u8 = 3;

/// Hardware settling delay between recovery steps
pub const SETTLE_DELAY_MS: u32 = 200;

// ── Configuration document ─────────────────────────────────────────────────

/// Accepted range for the channel ratio
pub const RATIO_MIN: f32 = 0.0;
pub const RATIO_MAX: f32 = 100.0;

/// Accepted range for the threshold limit
pub const LIMIT_MIN: f32 = 0.0;
pub const LIMIT_MAX: f32 = 200.0;

/// Values applied by callers when the document is missing or invalid
pub const DEFAULT_RATIO: f32 = 1.0;
pub const DEFAULT_LIMIT: f32 = 100.0;

// ── Bounded buffers ────────────────────────────────────────────────────────

/// Longest generated file name ("sampleData" + 14 digits + "_65535.txt" = 34)
pub const FILENAME_CAP: usize = 40;

/// Longest volume-relative path ("overLimit/" + file name)
pub const PATH_CAP: usize = 48;

/// Longest formatted record, hidden records included
pub const LINE_CAP: usize = 256;

/// Longest config.ini line the parser accepts; comments may be longer
pub const CONFIG_LINE_CAP: usize = 128;

/// Receive frame size handed from the UART to the command task
pub const FRAME_CAP: usize = 128;

// ── Persisted layout ───────────────────────────────────────────────────────

pub const CONFIG_PATH: &str = "config.ini";
pub const BOOT_COUNT_PATH: &str = "boot_count.txt";

// ── Scheduler ──────────────────────────────────────────────────────────────

/// Maximum number of cooperative tasks
pub const MAX_TASKS: usize = 8;

/// Task periods used by the firmware
pub const SAMPLE_TASK_PERIOD_MS: u32 = 5;
pub const COMMAND_TASK_PERIOD_MS: u32 = 5;
pub const HOUSEKEEPING_TASK_PERIOD_MS: u32 = 1_000;

/// Default sampling cycle (seconds between stored measurements)
pub const DEFAULT_SAMPLE_CYCLE_S: u32 = 5;

// ── Firmware hardware ──────────────────────────────────────────────────────

/// SD SPI initialization frequency (slow for card init)
pub const SD_SPI_INIT_FREQ: u32 = 400_000;

/// SD SPI working frequency after init
pub const SD_SPI_WORK_FREQ: u32 = 16_000_000;

/// UART baudrate for the command port
pub const UART_BAUDRATE: u32 = 115_200;

/// Embassy BufferedUart RX buffer size
pub const UART_RX_BUF_SIZE: usize = 256;

/// Line silence that ends a command frame
pub const UART_IDLE_MS: u64 = 20;

/// Watchdog timeout; a recovery must finish well inside it
pub const WATCHDOG_TIMEOUT_S: u64 = 5;

/// ADC reference voltage and full-scale count (12-bit)
pub const ADC_VREF: f32 = 3.3;
pub const ADC_FULL_SCALE: f32 = 4096.0;
