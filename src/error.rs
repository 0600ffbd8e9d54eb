//! Error taxonomy and the status code returned to collaborators

use thiserror::Error;

/// Failure reported by a [`Volume`](crate::volume::Volume) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("filesystem not mounted")]
    NotMounted,
    #[error("invalid name")]
    InvalidName,
    #[error("too many open handles")]
    TooManyOpen,
    #[error("disk full")]
    DiskFull,
    #[error("device I/O error")]
    Io,
}

/// Why a medium recovery attempt did not restore the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum RecoveryError {
    #[error("recovery already in progress")]
    InProgress,
    #[error("recovery cooldown active")]
    CoolingDown,
    #[error("recovery locked out after repeated failures")]
    LockedOut,
    #[error("card init failed after all retries")]
    CardInitExhausted,
    #[error("remount failed: {0}")]
    Remount(FsError),
}

/// A record did not fit its bounded line buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[error("formatted text exceeds buffer capacity")]
pub struct FormatError;

/// Errors of the storage layer, following the device error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum StorageError {
    /// Expected absence, e.g. no config document yet
    #[error("not found")]
    NotFound,
    /// Caller contract violation (oversized text, out-of-range value)
    #[error("invalid input")]
    InvalidInput,
    /// The document exists but is incomplete
    #[error("configuration document incomplete")]
    InvalidDocument,
    /// Medium absent at initialization
    #[error("storage medium not ready")]
    NoMedium,
    #[error("I/O error: {0}")]
    Io(FsError),
    #[error("recovery exhausted: {0}")]
    RecoveryExhausted(RecoveryError),
}

impl From<FormatError> for StorageError {
    fn from(_: FormatError) -> Self {
        StorageError::InvalidInput
    }
}

impl From<RecoveryError> for StorageError {
    fn from(e: RecoveryError) -> Self {
        StorageError::RecoveryExhausted(e)
    }
}

impl From<FsError> for StorageError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound => StorageError::NotFound,
            e => StorageError::Io(e),
        }
    }
}

/// Status code of the collaborator-facing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Status {
    Ok,
    Error,
    NotFound,
    InvalidInput,
}

impl From<StorageError> for Status {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => Status::NotFound,
            StorageError::InvalidInput => Status::InvalidInput,
            StorageError::InvalidDocument
            | StorageError::NoMedium
            | StorageError::Io(_)
            | StorageError::RecoveryExhausted(_) => Status::Error,
        }
    }
}

impl<T> From<Result<T, StorageError>> for Status {
    fn from(r: Result<T, StorageError>) -> Self {
        match r {
            Ok(_) => Status::Ok,
            Err(e) => e.into(),
        }
    }
}
