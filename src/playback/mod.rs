//! Drives sequential or random-access delivery of packets from a
//! [`crate::index::PacketIndex`] to a caller-supplied sink, paced either
//! in real time or as fast as the scheduler allows.
//!
//! The timer/tick loop is grounded on `util::thread::ThreadPoll`'s
//! producer-thread shape: an external scheduler calls [`PlaybackEngine::tick`]
//! once per interval computed by [`PlaybackEngine::next_interval`].

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{trace, warn};

use crate::event::{CoreEvents, ReportedError};
use crate::index::PacketIndex;
use crate::packet::{PacketHeader, HEADER_SIZE};

/// Lower/upper clamp on the real-time pacing interval between packets.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);
pub const MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Allowed range for [`PlaybackEngine::set_speed`].
pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;

/// Consecutive per-entry read failures before playback gives up fatally.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// What to do when the sink cannot accept a packet within one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Drop the tick, counted as a non-fatal warning (default).
    Drop,
    /// Re-offer the same packet on the next tick instead of advancing.
    Stall,
}

impl Default for Backpressure {
    fn default() -> Self {
        Backpressure::Drop
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    pub realtime: bool,
    pub speed: f64,
    pub loop_playback: bool,
    pub backpressure: Backpressure,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { realtime: true, speed: 1.0, loop_playback: false, backpressure: Backpressure::Drop }
    }
}

/// One packet handed to the sink: header plus raw payload bytes, and the
/// index position it was delivered from.
#[derive(Clone)]
pub struct TypedPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
    pub entry_index: u64,
}

impl std::fmt::Debug for TypedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedPacket")
            .field("header", &self.header)
            .field("payload", &crate::util::BytesFmt(&self.payload))
            .field("entry_index", &self.entry_index)
            .finish()
    }
}

/// Downstream consumer of delivered packets. `accept` must return quickly:
/// the engine never queues more than one outstanding packet, so a sink
/// that blocks here stalls the whole playback tick.
pub trait PacketSink {
    fn accept(&mut self, packet: &TypedPacket) -> bool;
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no file loaded")]
    NoFileLoaded,
    #[error("i/o error reading packet: {0}")]
    ReadError(#[from] std::io::Error),
}

/// Outcome of a single [`PlaybackEngine::tick`] call.
#[derive(Debug)]
pub enum TickOutcome {
    Delivered(TypedPacket),
    /// The sink rejected the packet and it was dropped per backpressure policy.
    Dropped,
    /// The sink rejected the packet and it will be retried next tick.
    Stalled,
    EndOfFile,
    /// The engine is not in `Playing` state; nothing was delivered.
    NotPlaying,
}

/// A state machine driving packet delivery from an index, one packet per
/// tick, in strict index order within a play pass.
pub struct PlaybackEngine {
    index: Option<Arc<PacketIndex>>,
    state: PlaybackState,
    next_index: u64,
    config: PlaybackConfig,
    consecutive_failures: u32,
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new(PlaybackConfig::default())
    }
}

impl PlaybackEngine {

    pub fn new(config: PlaybackConfig) -> Self {
        Self { index: None, state: PlaybackState::Stopped, next_index: 0, config, consecutive_failures: 0 }
    }

    pub fn load_index(&mut self, index: Arc<PacketIndex>) {
        self.index = Some(index);
        self.state = PlaybackState::Stopped;
        self.next_index = 0;
        self.consecutive_failures = 0;
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn play(&mut self, events: &dyn CoreEvents) -> Result<(), PlaybackError> {
        if self.index.is_none() {
            return Err(PlaybackError::NoFileLoaded);
        }
        self.state = PlaybackState::Playing;
        events.on_playback_state_changed(self.state);
        Ok(())
    }

    pub fn pause(&mut self, events: &dyn CoreEvents) {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
            events.on_playback_state_changed(self.state);
        }
    }

    /// Stops and resets the next-delivery position to 0.
    pub fn stop(&mut self, events: &dyn CoreEvents) {
        self.state = PlaybackState::Stopped;
        self.next_index = 0;
        self.consecutive_failures = 0;
        events.on_playback_state_changed(self.state);
    }

    /// No-op at the last index unless looping.
    pub fn step_forward(&mut self, events: &dyn CoreEvents) {
        let Some(index) = &self.index else { return };
        let len = index.len() as u64;
        if len == 0 {
            return;
        }
        if self.next_index + 1 < len {
            self.next_index += 1;
        } else if self.config.loop_playback {
            self.next_index = 0;
        } else {
            return;
        }
        events.on_seek_completed(self.next_index);
    }

    /// No-op at index 0.
    pub fn step_backward(&mut self, events: &dyn CoreEvents) {
        if self.next_index > 0 {
            self.next_index -= 1;
            events.on_seek_completed(self.next_index);
        }
    }

    pub fn seek_to_packet(&mut self, n: u64, events: &dyn CoreEvents) {
        let Some(index) = &self.index else { return };
        let len = index.len() as u64;
        self.next_index = n.min(len.saturating_sub(1).max(0));
        if len == 0 {
            self.next_index = 0;
        }
        events.on_seek_completed(self.next_index);
    }

    /// `fraction` is clamped to `[0, 1]` and mapped onto the index range.
    pub fn seek_to_position(&mut self, fraction: f64, events: &dyn CoreEvents) {
        let Some(index) = &self.index else { return };
        let len = index.len() as u64;
        if len == 0 {
            self.next_index = 0;
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.next_index = ((len - 1) as f64 * fraction).round() as u64;
        events.on_seek_completed(self.next_index);
    }

    /// Seeks to the first entry with timestamp `>= t`; clamps to the last
    /// entry if every timestamp is smaller.
    pub fn seek_to_timestamp(&mut self, t: u64, events: &dyn CoreEvents) {
        let Some(index) = &self.index else { return };
        match index.by_timestamp(t) {
            Some(idx) => self.next_index = idx as u64,
            None => self.next_index = index.len().saturating_sub(1) as u64,
        }
        events.on_seek_completed(self.next_index);
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.config.speed = speed.clamp(MIN_SPEED, MAX_SPEED);
    }

    pub fn set_loop(&mut self, loop_playback: bool) {
        self.config.loop_playback = loop_playback;
    }

    pub fn set_realtime(&mut self, realtime: bool) {
        self.config.realtime = realtime;
    }

    pub fn current_packet(&self) -> u64 {
        self.next_index
    }

    pub fn total_packets(&self) -> u64 {
        self.index.as_ref().map(|i| i.len() as u64).unwrap_or(0)
    }

    pub fn playback_progress(&self) -> f64 {
        let total = self.total_packets();
        if total == 0 { 0.0 } else { self.next_index as f64 / total as f64 }
    }

    /// Interval an external scheduler should wait before calling
    /// [`Self::tick`] again, per spec.md §4.7's cadence rule.
    pub fn next_interval(&self) -> Duration {
        let Some(index) = &self.index else { return MIN_INTERVAL };
        let base = if self.config.realtime {
            let cur = index.entries.get(self.next_index as usize);
            let next = index.entries.get((self.next_index + 1) as usize);
            match (cur, next) {
                (Some(a), Some(b)) if b.timestamp > a.timestamp => {
                    Duration::from_nanos(b.timestamp - a.timestamp)
                }
                _ => MIN_INTERVAL,
            }
        } else {
            MIN_INTERVAL
        };
        let scaled = base.div_f64(self.config.speed.max(MIN_SPEED));
        scaled.clamp(MIN_INTERVAL, MAX_INTERVAL)
    }

    /// Deliver (or retry delivering) one packet. Does nothing if not
    /// `Playing`. `reader` must be positioned anywhere — it seeks itself.
    pub fn tick<R: Read + Seek, S: PacketSink>(
        &mut self,
        reader: &mut R,
        sink: &mut S,
        events: &dyn CoreEvents,
    ) -> Result<TickOutcome, PlaybackError> {
        if self.state != PlaybackState::Playing {
            return Ok(TickOutcome::NotPlaying);
        }
        let Some(index) = self.index.clone() else {
            return Err(PlaybackError::NoFileLoaded);
        };

        if self.next_index as usize >= index.len() {
            events.on_end_of_file_reached();
            if self.config.loop_playback {
                self.next_index = 0;
            } else {
                self.state = PlaybackState::Stopped;
            }
            return Ok(TickOutcome::EndOfFile);
        }

        let entry = index.entries[self.next_index as usize];
        match read_packet(reader, &entry, self.next_index) {
            Ok(packet) => {
                self.consecutive_failures = 0;
                if sink.accept(&packet) {
                    self.next_index += 1;
                    trace!(entry_index = packet.entry_index, "delivered packet");
                    Ok(TickOutcome::Delivered(packet))
                } else {
                    match self.config.backpressure {
                        Backpressure::Drop => {
                            warn!(entry_index = self.next_index, "sink rejected packet, dropping tick");
                            self.next_index += 1;
                            Ok(TickOutcome::Dropped)
                        }
                        Backpressure::Stall => Ok(TickOutcome::Stalled),
                    }
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                events.on_error(&ReportedError { message: e.to_string(), fatal: self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES });
                self.next_index += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    self.state = PlaybackState::Stopped;
                }
                Err(e)
            }
        }
    }
}

fn read_packet<R: Read + Seek>(reader: &mut R, entry: &crate::index::PacketIndexEntry, entry_index: u64) -> Result<TypedPacket, std::io::Error> {
    reader.seek(SeekFrom::Start(entry.file_position))?;
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = PacketHeader::from_bytes(&header_bytes)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupted packet header at indexed position"))?;
    let mut payload = vec![0u8; header.payload_size as usize];
    reader.read_exact(&mut payload)?;
    Ok(TypedPacket { header, payload, entry_index })
}
