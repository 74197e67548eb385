//! Core of a telemetry-monitoring application: a C-style struct/union/typedef
//! parser with a compiler-accurate memory layout engine, and an offline
//! packet indexing and playback engine.
//!
//! The parser and layout engine (see [`lexer`], [`preprocessor`], [`parser`],
//! [`abi`], [`layout`], [`registry`]) reproduce MSVC / GCC / Clang struct
//! layout rules bit-for-bit, including bitfields, `#pragma pack` and
//! per-ABI primitive sizes, so that field offsets computed here match the
//! offsets a real compiler would have used to write the recorded packets.
//!
//! The indexing and playback engine (see [`packet`], [`index`], [`playback`])
//! scans a flat binary file of [`packet::PacketHeader`]-prefixed records,
//! builds a seekable index, and drives ordered, speed-controlled, seekable
//! delivery of packets to a caller-supplied sink.
//!
//! GUI widgets, logging sinks, configuration dialogs, network sources and
//! charting are external collaborators and are not part of this crate.

pub mod util;
pub mod event;

pub mod packet;

pub mod lexer;
pub mod preprocessor;
pub mod ast;
pub mod parser;

pub mod abi;
pub mod layout;
pub mod registry;
pub mod serialize;

pub mod index;
pub mod playback;
