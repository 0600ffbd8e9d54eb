//! # sensor_logger
//!
//! Storage layer of a single-channel voltage logger: SD card lifecycle with
//! rate-limited recovery, category-organized record files with bounded
//! rotation, `config.ini` and boot counter persistence, and the cooperative
//! scheduler the device runs it from.
//!
//! Hardware is reached only through [`volume::Volume`],
//! [`volume::MediumController`], [`clock::Clock`] and
//! [`embedded_hal::delay::DelayNs`]. The `sdmmc` feature adds adapters for
//! `embedded-sdmmc`.
//!
//! ## Features
//!
//! * `log` (default): diagnostics through the `log` crate.
//! * `defmt-log`: diagnostics through `defmt` instead.
//! * `sdmmc`: [`sdmmc`] adapters.
//! * `rp2350`: the firmware binary.

#![cfg_attr(not(test), no_std)]

// must come first so the macros are visible in every module below
#[macro_use]
mod fmt;

pub mod clock;
pub mod command;
pub mod config;
pub mod config_store;
pub mod error;
pub mod mailbox;
pub mod medium;
pub mod record;
pub mod scheduler;
#[cfg(feature = "sdmmc")]
pub mod sdmmc;
pub mod storage;
pub mod volume;

#[cfg(test)]
mod testing;

pub use crate::clock::{Clock, DateTime};
pub use crate::config_store::ConfigDocument;
pub use crate::error::{FsError, RecoveryError, Status, StorageError};
pub use crate::medium::{MediumManager, MediumState};
pub use crate::record::Category;
pub use crate::storage::{Diagnosis, FileCursor, MediumInfo, StorageSubsystem};
pub use crate::volume::{MediumController, OpenMode, Volume};
