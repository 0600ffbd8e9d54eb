//! Medium lifecycle: mount checks and rate-limited stack recovery

use embedded_hal::delay::DelayNs;

use crate::clock::elapsed_ms;
use crate::config::{
    CARD_INIT_RETRIES, MAX_CONSECUTIVE_FAILURES, RECOVERY_COOLDOWN_MS, RECOVERY_LOCKOUT_MS,
    SETTLE_DELAY_MS,
};
use crate::error::RecoveryError;
use crate::volume::{MediumController, Volume};

/// Observable state of the storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum MediumState {
    /// Nothing known yet
    Unknown,
    /// Medium present, filesystem not mounted
    Ready,
    /// Filesystem operations may proceed
    Mounted,
    /// An I/O failure was seen and not yet recovered
    Degraded,
    /// A recovery is running
    RecoveryInFlight,
    /// Too many consecutive failures, waiting for the lockout to expire
    Lockout,
}

/// Owns the storage controller and the recovery bookkeeping.
pub struct MediumManager<C, D> {
    controller: C,
    delay: D,
    last_attempt_ms: Option<u32>,
    consecutive_failures: u8,
    in_flight: bool,
    medium_ready: bool,
    mounted: bool,
    degraded: bool,
}

impl<C: MediumController, D: DelayNs> MediumManager<C, D> {
    pub fn new(controller: C, delay: D) -> Self {
        Self {
            controller,
            delay,
            last_attempt_ms: None,
            consecutive_failures: 0,
            in_flight: false,
            medium_ready: false,
            mounted: false,
            degraded: false,
        }
    }

    pub fn controller(&mut self) -> &mut C {
        &mut self.controller
    }

    /// Ask the controller whether a card is present and ready.
    pub fn is_medium_ready(&mut self) -> bool {
        self.medium_ready = self.controller.is_ready();
        self.medium_ready
    }

    /// `(sector_size, sector_count)`, `None` without a ready medium.
    pub fn capacity(&mut self) -> Option<(u32, u32)> {
        if !self.is_medium_ready() {
            return None;
        }
        self.controller.capacity()
    }

    /// Make sure the filesystem is usable, mounting only if the probe fails.
    pub fn ensure_mounted<V: Volume>(&mut self, volume: &mut V) -> bool {
        if volume.probe().is_ok() {
            self.mounted = true;
            return true;
        }
        match volume.mount() {
            Ok(()) => {
                info!("filesystem mounted");
                self.mounted = true;
                true
            }
            Err(e) => {
                warn!("mount failed: {:?}", e);
                self.mounted = false;
                false
            }
        }
    }

    /// Record that a file operation failed on the mounted volume.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }

    pub fn state(&self, now_ms: u32) -> MediumState {
        if self.in_flight {
            MediumState::RecoveryInFlight
        } else if self.locked_out(now_ms) {
            MediumState::Lockout
        } else if self.degraded || self.consecutive_failures > 0 {
            MediumState::Degraded
        } else if self.mounted {
            MediumState::Mounted
        } else if self.medium_ready {
            MediumState::Ready
        } else {
            MediumState::Unknown
        }
    }

    fn locked_out(&self, now_ms: u32) -> bool {
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
            && self
                .last_attempt_ms
                .is_some_and(|last| elapsed_ms(now_ms, last) < RECOVERY_LOCKOUT_MS)
    }

    /// Tear down and rebuild the whole storage stack.
    ///
    /// Refused while another recovery runs, within the cooldown of the last
    /// attempt, and during the lockout that follows
    /// [`MAX_CONSECUTIVE_FAILURES`] failed attempts.
    pub fn recover<V: Volume>(&mut self, volume: &mut V, now_ms: u32) -> Result<(), RecoveryError> {
        if self.in_flight {
            debug!("recovery already in progress");
            return Err(RecoveryError::InProgress);
        }
        if let Some(last) = self.last_attempt_ms {
            if elapsed_ms(now_ms, last) < RECOVERY_COOLDOWN_MS {
                debug!("recovery cooldown active");
                return Err(RecoveryError::CoolingDown);
            }
        }
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            if self.locked_out(now_ms) {
                return Err(RecoveryError::LockedOut);
            }
            self.consecutive_failures = 0;
        }

        self.last_attempt_ms = Some(now_ms);
        self.in_flight = true;
        let result = self.rebuild_stack(volume);
        self.in_flight = false;

        match result {
            Ok(()) => {
                info!("storage stack reinitialized");
                self.consecutive_failures = 0;
                self.mounted = true;
                self.medium_ready = true;
                self.degraded = false;
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.mounted = false;
                error!(
                    "storage recovery failed ({}/{}): {:?}",
                    self.consecutive_failures,
                    MAX_CONSECUTIVE_FAILURES,
                    e
                );
            }
        }
        result
    }

    fn rebuild_stack<V: Volume>(&mut self, volume: &mut V) -> Result<(), RecoveryError> {
        volume.unmount();
        self.delay.delay_ms(SETTLE_DELAY_MS);

        self.controller.deinit();
        self.delay.delay_ms(SETTLE_DELAY_MS);

        self.controller.configure();
        self.delay.delay_ms(SETTLE_DELAY_MS);

        let mut card_ok = false;
        for attempt in 1..=CARD_INIT_RETRIES {
            match self.controller.init_card() {
                Ok(()) => {
                    card_ok = true;
                    break;
                }
                Err(e) => {
                    warn!("card init attempt {}/{} failed: {:?}", attempt, CARD_INIT_RETRIES, e);
                    self.delay.delay_ms(SETTLE_DELAY_MS);
                }
            }
        }
        if !card_ok {
            return Err(RecoveryError::CardInitExhausted);
        }

        volume.mount().map_err(RecoveryError::Remount)
    }

    #[cfg(test)]
    pub(crate) fn force_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }
}
