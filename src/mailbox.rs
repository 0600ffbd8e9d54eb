//! Single-slot, latest-value-wins hand-off from the receive context to the
//! task that processes frames.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::Vec;
use thiserror::Error;

use crate::config::FRAME_CAP;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum MailboxError {
    #[error("frame exceeds mailbox capacity")]
    Oversized,
}

pub type Frame<const N: usize = FRAME_CAP> = Vec<u8, N>;

pub struct Mailbox<M: RawMutex, const N: usize = FRAME_CAP> {
    slot: Signal<M, Frame<N>>,
    dropped: Mutex<M, Cell<u32>>,
}

impl<M: RawMutex, const N: usize> Default for Mailbox<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const N: usize> Mailbox<M, N> {
    pub const fn new() -> Self {
        Self {
            slot: Signal::new(),
            dropped: Mutex::const_new(M::INIT, Cell::new(0)),
        }
    }

    /// Copy `bytes` out of the receive buffer, re-arm reception, then raise
    /// the flag.
    ///
    /// `rearm` runs before the frame becomes visible so a byte arriving while
    /// the consumer works lands in a live buffer. An unconsumed frame is
    /// replaced. Oversized input is dropped, but reception is still re-armed.
    pub fn publish(&self, bytes: &[u8], rearm: impl FnOnce()) -> Result<(), MailboxError> {
        let frame = Frame::<N>::from_slice(bytes);
        rearm();

        let Ok(frame) = frame else {
            warn!("dropping {} byte frame, capacity {}", bytes.len(), N);
            self.dropped.lock(|d| d.set(d.get().wrapping_add(1)));
            return Err(MailboxError::Oversized);
        };
        if self.slot.signaled() {
            debug!("unconsumed frame replaced");
        }
        self.slot.signal(frame);
        Ok(())
    }

    /// Take the pending frame, clearing the flag before the caller processes it.
    pub fn take(&self) -> Option<Frame<N>> {
        self.slot.try_take()
    }

    pub async fn wait(&self) -> Frame<N> {
        self.slot.wait().await
    }

    pub fn is_pending(&self) -> bool {
        self.slot.signaled()
    }

    /// Frames dropped for exceeding the capacity.
    pub fn dropped(&self) -> u32 {
        self.dropped.lock(Cell::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type Mb = Mailbox<CriticalSectionRawMutex, 8>;

    #[test]
    fn frame_is_delivered_once() {
        let mb = Mb::new();
        assert!(mb.take().is_none());
        mb.publish(b"start", || {}).unwrap();
        assert!(mb.is_pending());
        assert_eq!(mb.take().unwrap().as_slice(), b"start");
        assert!(!mb.is_pending());
        assert!(mb.take().is_none());
    }

    #[test]
    fn latest_frame_wins() {
        let mb = Mb::new();
        mb.publish(b"ratio 2", || {}).unwrap();
        mb.publish(b"stop", || {}).unwrap();
        assert_eq!(mb.take().unwrap().as_slice(), b"stop");
    }

    #[test]
    fn rearm_happens_before_the_frame_is_visible() {
        let mb = Mb::new();
        let mut seen_pending = None;
        mb.publish(b"hide", || seen_pending = Some(mb.is_pending())).unwrap();
        assert_eq!(seen_pending, Some(false));
        assert!(mb.is_pending());
    }

    #[test]
    fn frame_arriving_during_processing_is_kept() {
        let mb = Mb::new();
        mb.publish(b"conf", || {}).unwrap();
        let first = mb.take().unwrap();
        mb.publish(b"unhide", || {}).unwrap();
        assert_eq!(first.as_slice(), b"conf");
        assert_eq!(mb.take().unwrap().as_slice(), b"unhide");
    }

    #[test]
    fn oversized_frame_is_dropped_but_rearms() {
        let mb = Mb::new();
        let mut rearmed = false;
        assert_eq!(
            mb.publish(b"far too long", || rearmed = true),
            Err(MailboxError::Oversized)
        );
        assert!(rearmed);
        assert!(!mb.is_pending());
        assert_eq!(mb.dropped(), 1);
    }
}
