//! Real-time core of a MIDI sequencer: event model, transport, patch bay,
//! per-track recording/playback paths, and the sampler process supervisor.
//! Deliberately not an application: no GUI, no document persistence beyond
//! the abstract entity tree in [`document`], no device-scan UI, no config
//! discovery beyond [`config::Config::load`].

pub mod arena;
pub mod block;
pub mod common;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod event_list;
pub mod notify;
pub mod patch_bay;
pub mod playback_path;
pub mod port_client;
pub mod recording_path;
pub mod supervisor;
pub mod track;
pub mod track_list;
pub mod transport;
pub mod unit;
pub mod util;
