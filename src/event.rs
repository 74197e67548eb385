//! Replaces the host signal/slot mechanism used by the original application
//! to notify of progress and state changes: a single trait the core calls
//! into, implemented once by whatever hosts it (GUI, CLI, test harness).

use std::fmt;
use std::time::Duration;

use crate::index::IndexStatus;
use crate::playback::PlaybackState;


/// Progress of a long-running scan, reported by the [`crate::index::FileIndexer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub bytes_scanned: u64,
    pub bytes_total: u64,
    pub packets_found: u64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            1.0
        } else {
            self.bytes_scanned as f64 / self.bytes_total as f64
        }
    }
}

/// An error reported by a background component as a non-fatal event rather
/// than returned from a call, because the failing call already returned.
#[derive(Debug, Clone)]
pub struct ReportedError {
    pub message: String,
    pub fatal: bool,
}

impl fmt::Display for ReportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Notifications emitted by the indexer and the playback engine. The host
/// implements this trait once; every method has a no-op default so an
/// implementer only overrides the events it cares about.
pub trait CoreEvents {
    /// Indexing or playback progress changed.
    fn on_progress_changed(&self, _progress: Progress) {}

    /// The indexer or playback engine changed its state machine status.
    fn on_index_state_changed(&self, _status: IndexStatus) {}

    /// The playback engine transitioned to a new [`PlaybackState`].
    fn on_playback_state_changed(&self, _state: PlaybackState) {}

    /// Indexing finished, successfully or not; `duration` is wall-clock time spent.
    fn on_indexing_completed(&self, _status: IndexStatus, _duration: Duration) {}

    /// A seek operation finished and playback is positioned at `packet_index`.
    fn on_seek_completed(&self, _packet_index: u64) {}

    /// Playback reached the last index entry.
    fn on_end_of_file_reached(&self) {}

    /// A non-fatal (or fatal, see `error.fatal`) error occurred.
    fn on_error(&self, _error: &ReportedError) {}
}

/// An implementation of [`CoreEvents`] that discards every event, used
/// where a caller has no interest in notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl CoreEvents for NullEvents {}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction_handles_zero_total() {
        let p = Progress { bytes_scanned: 0, bytes_total: 0, packets_found: 0 };
        assert_eq!(p.fraction(), 1.0);
    }

    #[test]
    fn progress_fraction_computes_ratio() {
        let p = Progress { bytes_scanned: 50, bytes_total: 200, packets_found: 3 };
        assert_eq!(p.fraction(), 0.25);
    }

    #[test]
    fn null_events_accepts_every_call() {
        let events = NullEvents;
        events.on_progress_changed(Progress { bytes_scanned: 0, bytes_total: 0, packets_found: 0 });
        events.on_error(&ReportedError { message: "x".into(), fatal: false });
    }
}
