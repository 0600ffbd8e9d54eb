//! File rotation and record persistence
//!
//! Each [`Category`] has a [`FileCursor`] naming the file currently being
//! filled. After [`RECORDS_PER_FILE`] records a new name is generated: the
//! log category uses the boot counter (`log7.txt`, one file per boot), every
//! other category the RTC time (`sampleData20250101120000.txt`). A file
//! that fills within one second is followed by `..._1.txt`, `..._2.txt`.
//!
//! Every record is opened, appended, synced and closed on its own so a card
//! pulled between records loses nothing already written. A failed open
//! triggers one medium recovery and one retry; records that still cannot be
//! written are dropped.

use core::fmt::Write;

use embedded_hal::delay::DelayNs;
use heapless::String;

use crate::clock::Clock;
use crate::config::{FILENAME_CAP, LIMIT_MAX, LIMIT_MIN, PATH_CAP, RATIO_MAX, RATIO_MIN, RECORDS_PER_FILE};
use crate::config_store::{self, ConfigDocument};
use crate::error::{FormatError, FsError, StorageError, Status};
use crate::medium::{MediumManager, MediumState};
use crate::record::{self, Category};
use crate::volume::{write_all, EntryInfo, MediumController, OpenMode, Volume};

pub type FileName = String<FILENAME_CAP>;
type FilePath = String<PATH_CAP>;

/// Active file of one category.
#[derive(Debug, Clone, Default)]
pub struct FileCursor {
    filename: FileName,
    records: u16,
    designated: bool,
    /// Unsuffixed name the current file was generated from
    stamp: FileName,
    serial: u16,
}

impl FileCursor {
    pub fn filename(&self) -> Option<&str> {
        self.designated.then_some(self.filename.as_str())
    }

    /// Records appended to the current file
    pub fn records(&self) -> u16 {
        self.records
    }

    fn needs_new_file(&self) -> bool {
        !self.designated || self.records >= RECORDS_PER_FILE
    }

    fn start(&mut self, filename: FileName, stamp: FileName, serial: u16) {
        self.filename = filename;
        self.stamp = stamp;
        self.serial = serial;
        self.records = 0;
        self.designated = true;
    }
}

/// Capacity of the inserted medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct MediumInfo {
    pub sector_size: u32,
    pub sector_count: u32,
    pub capacity_mib: u32,
}

/// Summary of a root directory inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Diagnosis {
    pub files: u32,
    pub dirs: u32,
    /// Size of `config.ini`, if present
    pub config_size: Option<u32>,
}

/// The storage layer: one owner for the volume, the medium lifecycle and
/// all per-category cursors.
pub struct StorageSubsystem<V, C, D, K> {
    volume: V,
    medium: MediumManager<C, D>,
    clock: K,
    cursors: [FileCursor; Category::COUNT],
    boot_count: u32,
    hidden: bool,
}

impl<V, C, D, K> StorageSubsystem<V, C, D, K>
where
    V: Volume,
    C: MediumController,
    D: DelayNs,
    K: Clock,
{
    pub fn new(volume: V, controller: C, delay: D, clock: K) -> Self {
        Self {
            volume,
            medium: MediumManager::new(controller, delay),
            clock,
            cursors: Default::default(),
            boot_count: 0,
            hidden: false,
        }
    }

    /// Mount, create the category directories and bump the boot counter.
    pub fn init(&mut self) -> Result<(), StorageError> {
        self.cursors = Default::default();
        info!("initializing data storage");

        if !self.medium.is_medium_ready() {
            warn!("SD card not ready, skipping storage init");
            return Err(StorageError::NoMedium);
        }
        if !self.medium.ensure_mounted(&mut self.volume) {
            error!("cannot mount filesystem");
            return Err(StorageError::Io(FsError::NotMounted));
        }

        self.create_directories();

        self.boot_count = config_store::read_boot_counter(&mut self.volume).saturating_add(1);
        if let Err(e) = config_store::write_boot_counter(&mut self.volume, self.boot_count) {
            warn!("failed to save boot count: {:?}", e);
        }

        info!("data storage initialized, boot count {}", self.boot_count);
        Ok(())
    }

    fn create_directories(&mut self) {
        for category in Category::ALL {
            let dir = category.directory();
            match self.volume.create_dir(dir) {
                Ok(()) => info!("created directory {}", dir),
                Err(FsError::AlreadyExists) => {}
                Err(e) => warn!("failed to create directory {}: {:?}", dir, e),
            }
        }
    }

    pub fn boot_count(&self) -> u32 {
        self.boot_count
    }

    pub fn cursor(&self, category: Category) -> &FileCursor {
        &self.cursors[category.index()]
    }

    pub fn medium_state(&self) -> MediumState {
        self.medium.state(self.clock.monotonic_ms())
    }

    pub fn set_hidden_mode(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn hidden_mode(&self) -> bool {
        self.hidden
    }

    /// Name for the next file of `category`.
    pub fn generate_filename(&self, category: Category) -> Result<FileName, StorageError> {
        let mut name = FileName::new();
        match category {
            Category::Log => write!(name, "{}{}.txt", category.prefix(), self.boot_count),
            _ => write!(name, "{}{}.txt", category.prefix(), self.clock.now().compact()),
        }
        .map_err(|_| FormatError)?;
        Ok(name)
    }

    /// Append `text` plus a line terminator to the active file of `category`.
    pub fn write_record(&mut self, category: Category, text: &str) -> Result<(), StorageError> {
        if self.cursors[category.index()].needs_new_file() {
            let stamp = self.generate_filename(category)?;
            let cursor = &mut self.cursors[category.index()];
            let serial = match category {
                Category::Log => 0,
                _ if cursor.designated && cursor.stamp == stamp => cursor.serial.wrapping_add(1),
                _ => 0,
            };
            let name = if serial == 0 {
                stamp.clone()
            } else {
                with_serial(&stamp, serial)?
            };
            debug!("new file for {:?}: {}", category, name.as_str());
            cursor.start(name, stamp, serial);
        }

        let mut path = FilePath::new();
        write!(
            path,
            "{}/{}",
            category.directory(),
            self.cursors[category.index()].filename.as_str()
        )
        .map_err(|_| FormatError)?;

        let mut file = self.open_for_append(&path)?;
        let result = append_line(&mut self.volume, &mut file, text);
        let closed = self.volume.close(file);

        if let Err(e) = result.and(closed) {
            error!("write to {} failed: {:?}", path.as_str(), e);
            self.medium.mark_degraded();
            return Err(StorageError::Io(e));
        }

        self.cursors[category.index()].records += 1;
        Ok(())
    }

    /// Open with one recovery-and-retry on failure.
    fn open_for_append(&mut self, path: &str) -> Result<V::File, StorageError> {
        let err = match self.volume.open(path, OpenMode::WriteCreate) {
            Ok(file) => return Ok(file),
            Err(e) => e,
        };

        warn!("open {} failed ({:?}), reinitializing SD stack", path, err);
        self.medium.mark_degraded();
        let now = self.clock.monotonic_ms();
        if let Err(e) = self.medium.recover(&mut self.volume, now) {
            error!("record dropped, recovery refused: {:?}", e);
            return Err(StorageError::RecoveryExhausted(e));
        }

        match self.volume.open(path, OpenMode::WriteCreate) {
            Ok(file) => {
                info!("open succeeded after SD stack reinit");
                Ok(file)
            }
            Err(e) => {
                error!("record dropped, open still failing for {}: {:?}", path, e);
                self.medium.mark_degraded();
                Err(StorageError::Io(e))
            }
        }
    }

    /// Store a periodic sample. Nothing is stored in hidden mode.
    pub fn write_sample(&mut self, voltage: f32) -> Status {
        if self.hidden {
            return Status::Ok;
        }
        let at = self.clock.now();
        self.format_and_write(Category::Sample, record::sample_line(&at, voltage))
    }

    pub fn write_violation(&mut self, voltage: f32, limit: f32) -> Status {
        let at = self.clock.now();
        self.format_and_write(
            Category::ThresholdViolation,
            record::violation_line(&at, voltage, limit),
        )
    }

    pub fn write_log(&mut self, text: &str) -> Status {
        let at = self.clock.now();
        self.format_and_write(Category::Log, record::log_line(&at, text))
    }

    pub fn write_hidden(&mut self, voltage: f32, over_limit: bool) -> Status {
        let at = self.clock.now();
        self.format_and_write(
            Category::HiddenSample,
            record::hidden_line(&at, voltage, over_limit),
        )
    }

    fn format_and_write(
        &mut self,
        category: Category,
        line: Result<record::Line, FormatError>,
    ) -> Status {
        let result = line
            .map_err(StorageError::from)
            .and_then(|line| self.write_record(category, &line));
        result.into()
    }

    /// Store one measurement according to the current mode.
    ///
    /// Normal mode stores a sample, hidden mode a hidden record; a reading
    /// above `limit` is stored as a violation in both modes. Returns the
    /// first failure.
    pub fn record_measurement(&mut self, voltage: f32, limit: f32) -> Status {
        let over_limit = voltage > limit;
        let mut statuses = [Status::Ok; 2];

        statuses[0] = if self.hidden {
            self.write_hidden(voltage, over_limit)
        } else {
            self.write_sample(voltage)
        };
        if over_limit {
            statuses[1] = self.write_violation(voltage, limit);
        }

        statuses
            .into_iter()
            .find(|s| *s != Status::Ok)
            .unwrap_or(Status::Ok)
    }

    pub fn ensure_mounted(&mut self) -> bool {
        self.medium.ensure_mounted(&mut self.volume)
    }

    /// Run a medium recovery now, subject to cooldown and lockout.
    pub fn recover(&mut self) -> Result<(), StorageError> {
        let now = self.clock.monotonic_ms();
        self.medium.recover(&mut self.volume, now)?;
        Ok(())
    }

    fn mounted(&mut self) -> Result<(), StorageError> {
        if self.medium.ensure_mounted(&mut self.volume) {
            Ok(())
        } else {
            Err(StorageError::Io(FsError::NotMounted))
        }
    }

    /// Re-read `config.ini` from the medium.
    pub fn read_config(&mut self) -> Result<ConfigDocument, StorageError> {
        self.mounted()?;
        config_store::read_config(&mut self.volume)
    }

    pub fn write_config(&mut self, doc: &ConfigDocument) -> Result<(), StorageError> {
        self.mounted()?;
        config_store::write_config(&mut self.volume, doc)
    }

    pub fn write_ratio(&mut self, ratio: f32) -> Status {
        self.update_config(ratio, RATIO_MIN, RATIO_MAX, |doc, v| doc.ratio = v)
            .into()
    }

    pub fn write_limit(&mut self, limit: f32) -> Status {
        self.update_config(limit, LIMIT_MIN, LIMIT_MAX, |doc, v| doc.limit = v)
            .into()
    }

    fn update_config(
        &mut self,
        value: f32,
        min: f32,
        max: f32,
        apply: impl FnOnce(&mut ConfigDocument, f32),
    ) -> Result<(), StorageError> {
        if !value.is_finite() || value < min || value > max {
            return Err(StorageError::InvalidInput);
        }
        let mut doc = self.read_config()?;
        if !doc.valid {
            return Err(StorageError::InvalidDocument);
        }
        apply(&mut doc, value);
        self.write_config(&doc)
    }

    pub fn create_sample_config(&mut self) -> Status {
        let result = self
            .mounted()
            .and_then(|()| config_store::create_sample_config(&mut self.volume));
        result.into()
    }

    pub fn medium_info(&mut self) -> Result<MediumInfo, StorageError> {
        let (sector_size, sector_count) = self.medium.capacity().ok_or(StorageError::NotFound)?;
        let bytes = u64::from(sector_size) * u64::from(sector_count);
        Ok(MediumInfo {
            sector_size,
            sector_count,
            capacity_mib: (bytes / (1024 * 1024)) as u32,
        })
    }

    /// List the root directory through the log and check for `config.ini`.
    pub fn diagnose(&mut self) -> Result<Diagnosis, StorageError> {
        if let Err(e) = self.mounted() {
            error!("[SD] cannot mount filesystem");
            return Err(e);
        }
        info!("[SD] filesystem ready, root directory contents:");

        let mut report = Diagnosis::default();
        self.volume
            .list_root(&mut |entry: &EntryInfo| {
                if entry.is_dir {
                    report.dirs += 1;
                    info!("  [DIR]  {}", entry.name.as_str());
                } else {
                    report.files += 1;
                    info!("  [FILE] {} ({} bytes)", entry.name.as_str(), entry.size);
                }
            })
            .map_err(StorageError::Io)?;

        if report.files == 0 {
            warn!("[SD] no files in root directory, create config.ini on the card");
        }
        match self.volume.stat(crate::config::CONFIG_PATH) {
            Ok(size) => {
                info!("[SD] found config.ini ({} bytes)", size);
                report.config_size = Some(size);
            }
            Err(e) => warn!("[SD] config.ini not found: {:?}", e),
        }
        Ok(report)
    }

    #[cfg(test)]
    pub(crate) fn medium(&mut self) -> &mut MediumManager<C, D> {
        &mut self.medium
    }
}

/// `name.txt` -> `name_N.txt`
fn with_serial(stamp: &str, serial: u16) -> Result<FileName, FormatError> {
    let base = stamp.strip_suffix(".txt").unwrap_or(stamp);
    let mut name = FileName::new();
    write!(name, "{}_{}.txt", base, serial).map_err(|_| FormatError)?;
    Ok(name)
}

fn append_line<V: Volume>(volume: &mut V, file: &mut V::File, text: &str) -> Result<(), FsError> {
    // Append mode does not guarantee the cursor starts at EOF on every FAT driver.
    volume.seek_end(file)?;
    write_all(volume, file, text.as_bytes())?;
    write_all(volume, file, b"\n")?;
    volume.sync(file)
}
