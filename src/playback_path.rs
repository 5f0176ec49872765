//! Per-track output handler: walks a track's blocks under a moving
//! scheduling window and emits timed MIDI to the track's source port. No
//! direct teacher analogue (the source renders to an offline VST buffer,
//! not a live timed port); grounded on the data model's scheduling-window algorithm
//! and `recording_path.rs`'s open-note map idiom, run in reverse.

use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;

use log::warn;
use midly::{MidiMessage, PitchBend};

use crate::block::{Block, BlockId};
use crate::common::Seconds;
use crate::event::{AftertouchPoint, BendPoint, ChannelId, ControllerId, Event, EventId, Pitch};
use crate::port_client::{PortHandle, SharedPortClient};
use crate::track::Track;
use crate::track_list::SharedTrack;
use crate::transport::Transport;

const MIN_SCHEDULE_AHEAD: Seconds = 0.050;
const MAX_SCHEDULE_AHEAD: Seconds = 2.0 * MIN_SCHEDULE_AHEAD;

/// Encode semitones to a 14-bit pitch-bend value centered at 0x2000.
/// Inverse of `recording_path::decode_bend14`.
fn encode_bend14(semitones: f32, bend_range: f32) -> u16 {
    let raw = 8192.0 + (semitones * 16384.0 / bend_range).round();
    raw.clamp(0.0, 16383.0) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NoteKey {
    block: BlockId,
    event: EventId,
    repeat: u32,
}

struct OpenNote {
    pitch: Pitch,
    channel: ChannelId,
    start_abs: Seconds,
    end_abs: Seconds,
    bend: Vec<BendPoint>,
    aftertouch: Vec<AftertouchPoint>,
    next_bend: usize,
    next_aftertouch: usize,
}

pub struct PlaybackPath {
    track: SharedTrack,
    port: SharedPortClient,
    transport: Rc<RefCell<Transport>>,
    source_port: PortHandle,
    playing: bool,
    scheduled_to: Seconds,
    open_notes: HashMap<NoteKey, OpenNote>,
    channel_bends: HashMap<ChannelId, f32>,
    controller_cache: HashMap<ControllerId, f32>,
}

impl PlaybackPath {
    pub fn new(
        track: SharedTrack,
        port: SharedPortClient,
        transport: Rc<RefCell<Transport>>,
        source_port: PortHandle,
    ) -> PlaybackPath {
        PlaybackPath {
            track,
            port,
            transport,
            source_port,
            playing: false,
            scheduled_to: 0.0,
            open_notes: HashMap::new(),
            channel_bends: HashMap::new(),
            controller_cache: HashMap::new(),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// One pump tick, driven by the Transport's update cadence.
    pub fn pump(&mut self) {
        let enabled = self.track.borrow().enabled();
        if !enabled {
            if self.playing {
                self.end_all_notes();
                self.playing = false;
            }
            return;
        }
        let rolling = self.transport.borrow().is_rolling();
        if rolling && !self.playing {
            self.start();
        } else if !rolling && self.playing {
            self.stop();
            return;
        }
        if self.playing {
            self.schedule();
        }
    }

    fn start(&mut self) {
        let now = self.transport.borrow().time();
        self.emit_initial_controller_values(now);
        self.emit_bend_sensitivity_rpn();
        self.scheduled_to = now;
        self.playing = true;
    }

    fn stop(&mut self) {
        self.port.borrow_mut().clear_send(self.source_port);
        self.end_all_notes();
        self.playing = false;
    }

    /// Send note-off for every open outgoing note and a zero-bend for any
    /// channel left bent, then clear all playback state.
    fn end_all_notes(&mut self) {
        let notes: Vec<OpenNote> = self.open_notes.drain().map(|(_, n)| n).collect();
        for note in notes {
            let msg = MidiMessage::NoteOff {
                key: note.pitch.into(),
                vel: 0.into(),
            };
            self.send(note.channel, msg, 0.0);
        }
        let bends: Vec<ChannelId> = self.channel_bends.drain().map(|(ch, _)| ch).collect();
        for channel in bends {
            let msg = MidiMessage::PitchBend {
                bend: PitchBend::from_int(8192),
            };
            self.send(channel, msg, 0.0);
        }
    }

    fn emit_initial_controller_values(&mut self, now: Seconds) {
        let values = {
            let track = self.track.borrow();
            latest_controller_values_up_to(&track, now)
        };
        for (controller, value) in values {
            let level = (value * 127.0).round().clamp(0.0, 127.0) as u8;
            let msg = MidiMessage::Controller {
                controller: controller.into(),
                value: level.into(),
            };
            self.send(0, msg, 0.0);
            self.controller_cache.insert(controller, value);
        }
    }

    fn emit_bend_sensitivity_rpn(&mut self) {
        let bend_range = self.track.borrow().bend_range;
        let semitones = bend_range.trunc().clamp(0.0, 127.0) as u8;
        let cents = (bend_range.fract() * 100.0).round().clamp(0.0, 127.0) as u8;
        for channel in 0u8..16 {
            self.send(channel, MidiMessage::Controller { controller: 0x65.into(), value: 0.into() }, 0.0);
            self.send(channel, MidiMessage::Controller { controller: 0x64.into(), value: 0.into() }, 0.0);
            self.send(channel, MidiMessage::Controller { controller: 0x06.into(), value: semitones.into() }, 0.0);
            self.send(channel, MidiMessage::Controller { controller: 0x26.into(), value: cents.into() }, 0.0);
        }
    }

    fn schedule(&mut self) {
        let now = self.transport.borrow().time();
        if now - self.scheduled_to < MIN_SCHEDULE_AHEAD {
            return;
        }
        let begin = self.scheduled_to;
        let end = now + MAX_SCHEDULE_AHEAD;
        let bend_range = self.track.borrow().bend_range;

        let mut begins = Vec::new();
        let mut ccs = Vec::new();
        {
            let track = self.track.borrow();
            for block in track.blocks() {
                if !block.intersects(&(begin, end)) {
                    continue;
                }
                let span_end = end.min(block.end());
                for (et, repeat, ev) in events_in_window(block, begin, span_end) {
                    match &ev.event {
                        Event::Note(note) => {
                            let key = NoteKey { block: block.id, event: ev.id, repeat };
                            begins.push((key, et, note.clone()));
                        }
                        Event::CC(cc) => ccs.push((et, cc.controller, cc.value)),
                    }
                }
            }
        }

        for (key, et, note) in begins {
            let channel = (self.open_notes.len() as u8) & 0x0F;
            if let Some(first) = note.bend.first() {
                if first.time_offset == 0.0 && first.semitones != 0.0 {
                    let cached = self.channel_bends.get(&channel).copied().unwrap_or(0.0);
                    if (first.semitones - cached).abs() > f32::EPSILON {
                        let bend14 = encode_bend14(first.semitones, bend_range);
                        self.send(
                            channel,
                            MidiMessage::PitchBend { bend: PitchBend::from_int(bend14) },
                            et - now,
                        );
                        self.channel_bends.insert(channel, first.semitones);
                    }
                }
            }
            let velocity = (note.velocity * 127.0).round().clamp(0.0, 127.0) as u8;
            self.send(
                channel,
                MidiMessage::NoteOn { key: note.pitch.into(), vel: velocity.into() },
                et - now,
            );
            self.open_notes.insert(
                key,
                OpenNote {
                    pitch: note.pitch,
                    channel,
                    start_abs: et,
                    end_abs: et + note.duration,
                    bend: note.bend.clone(),
                    aftertouch: note.aftertouch.clone(),
                    next_bend: if note.bend.first().map(|b| b.time_offset == 0.0).unwrap_or(false) { 1 } else { 0 },
                    next_aftertouch: 0,
                },
            );
        }

        for (et, controller, value) in ccs {
            let level = (value * 127.0).round().clamp(0.0, 127.0) as u8;
            self.send(
                0,
                MidiMessage::Controller { controller: controller.into(), value: level.into() },
                et - now,
            );
            self.controller_cache.insert(controller, value);
        }

        let mut to_close = Vec::new();
        for (key, note) in self.open_notes.iter_mut() {
            while note.next_bend < note.bend.len() {
                let bp = note.bend[note.next_bend];
                let abs = note.start_abs + bp.time_offset;
                if abs >= end {
                    break;
                }
                if abs >= begin {
                    let bend14 = encode_bend14(bp.semitones, bend_range);
                    let _ = self.port.borrow_mut().send(
                        self.source_port,
                        note.channel,
                        MidiMessage::PitchBend { bend: PitchBend::from_int(bend14) },
                        (abs - now).max(0.0),
                    );
                    self.channel_bends.insert(note.channel, bp.semitones);
                }
                note.next_bend += 1;
            }
            while note.next_aftertouch < note.aftertouch.len() {
                let ap = note.aftertouch[note.next_aftertouch];
                let abs = note.start_abs + ap.time_offset;
                if abs >= end {
                    break;
                }
                if abs >= begin {
                    let level = (ap.velocity * 127.0).round().clamp(0.0, 127.0) as u8;
                    let _ = self.port.borrow_mut().send(
                        self.source_port,
                        note.channel,
                        MidiMessage::Aftertouch { key: note.pitch.into(), vel: level.into() },
                        (abs - now).max(0.0),
                    );
                }
                note.next_aftertouch += 1;
            }
            if note.end_abs >= begin && note.end_abs < end {
                to_close.push(*key);
            }
        }
        for key in to_close {
            if let Some(note) = self.open_notes.remove(&key) {
                let offset = note.end_abs - now;
                self.send(note.channel, MidiMessage::NoteOff { key: note.pitch.into(), vel: 0.into() }, offset);
            }
        }

        self.scheduled_to = end;
    }

    fn send(&mut self, channel: ChannelId, message: MidiMessage, time_offset: Seconds) {
        if let Err(err) = self.port.borrow_mut().send(self.source_port, channel, message, time_offset.max(0.0)) {
            warn!("playback send dropped: {err}");
        }
    }
}

/// Events whose absolute time falls in `[begin, end)`, across whichever
/// repeats of `block` the window straddles.
fn events_in_window(block: &Block, begin: Seconds, end: Seconds) -> Vec<(Seconds, u32, &crate::event::TimedEvent)> {
    let period = block.period();
    let block_end = block.end();
    let mut out = Vec::new();
    if period <= 0.0 || block.repeat_count() <= 1 {
        for ev in block.events.events() {
            let et = block.start + ev.time();
            if et >= begin && et < end && et < block_end {
                out.push((et, 0, ev));
            }
        }
        return out;
    }
    let begin_repeat = ((begin - block.start) / period).floor().max(0.0) as i64;
    let end_repeat = ((end - block.start) / period).ceil() as i64;
    let last_repeat = (block.repeat_count() - 1) as i64;
    for repeat in begin_repeat.max(0)..=end_repeat.min(last_repeat) {
        let repeat = repeat as u32;
        for ev in block.events.events() {
            let et = block.start + repeat as f64 * period + ev.time();
            if et >= begin && et < end && et < block_end {
                out.push((et, repeat, ev));
            }
        }
    }
    out
}

/// Latest value per controller among events at or before `at`, across every
/// block and repeat. Used to re-establish controller state on playback
/// start without replaying the whole history.
fn latest_controller_values_up_to(track: &Track, at: Seconds) -> HashMap<ControllerId, f32> {
    let mut latest: HashMap<ControllerId, (Seconds, f32)> = HashMap::new();
    for block in track.blocks() {
        if block.start > at {
            continue;
        }
        let period = block.period();
        let repeats = if period > 0.0 { block.repeat_count() } else { 1 };
        let block_end = block.end();
        for repeat in 0..repeats {
            for ev in block.events.events() {
                if let Event::CC(cc) = &ev.event {
                    let et = block.start + repeat as f64 * period + cc.time;
                    if et > at || et >= block_end {
                        continue;
                    }
                    latest
                        .entry(cc.controller)
                        .and_modify(|(t, v)| {
                            if et >= *t {
                                *t = et;
                                *v = cc.value;
                            }
                        })
                        .or_insert((et, cc.value));
                }
            }
        }
    }
    latest.into_iter().map(|(k, (_, v))| (k, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CCSet, Note};
    use crate::event_list::EventList;
    use crate::port_client::MockPortClient;
    use crate::recording_path::decode_bend14;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn bend14_roundtrip_is_within_one_step(semitones in -6.0f32..6.0, bend_range in 1.0f32..24.0) {
            let encoded = encode_bend14(semitones, bend_range);
            let decoded = decode_bend14(encoded, bend_range);
            let step = bend_range / 8192.0;
            prop_assert!((decoded - semitones.clamp(-bend_range, bend_range)).abs() <= step + 1e-3);
        }

        #[test]
        fn bend14_encoding_is_monotonic(a in -6.0f32..6.0, b in -6.0f32..6.0, bend_range in 1.0f32..24.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(encode_bend14(lo, bend_range) <= encode_bend14(hi, bend_range));
        }
    }

    fn fixture(block: Block) -> (PlaybackPath, Rc<RefCell<MockPortClient>>, PortHandle, Rc<RefCell<Transport>>) {
        let mock = Rc::new(RefCell::new(MockPortClient::new()));
        let port: SharedPortClient = mock.clone();
        let sink = mock
            .borrow_mut()
            .open_port("out", crate::port_client::PortDirection::Output, crate::unit::PortTypeTag::Midi)
            .unwrap();
        let transport = Rc::new(RefCell::new(Transport::new(port.clone())));
        let mut track = Track::new(1, "lead");
        track.push_block(block);
        let track: SharedTrack = Rc::new(RefCell::new(track));
        let path = PlaybackPath::new(track, port, transport.clone(), sink);
        (path, mock, sink, transport)
    }

    fn note_block() -> Block {
        let mut events = EventList::new();
        events.duration = 2.0;
        events.insert_note(Note::new(0.0, 0.5, 60, 0.8));
        Block::new(1, 0.0, events)
    }

    #[test]
    fn starting_playback_sends_rpn_to_all_sixteen_channels() {
        let (mut path, mock, sink, transport) = fixture(note_block());
        transport.borrow_mut().set_playing(true);
        path.pump();
        assert_eq!(16 * 4, mock.borrow().pending_count(sink));
    }

    #[test]
    fn note_begin_in_window_is_scheduled() {
        let (mut path, mock, sink, transport) = fixture(note_block());
        transport.borrow_mut().set_playing(true);
        path.pump();
        mock.borrow_mut().set_transport(true, 0.1);
        path.pump();
        let released = mock.borrow_mut().advance(0.0);
        let note_on = released.iter().any(|(_, _, msg)| matches!(msg, MidiMessage::NoteOn { vel, .. } if vel.as_int() > 0));
        assert!(note_on, "expected a note-on among {released:?}");
        let _ = sink;
    }

    #[test]
    fn stopping_sends_note_off_for_open_notes() {
        let mut long_events = EventList::new();
        long_events.duration = 5.0;
        long_events.insert_note(Note::new(0.0, 3.0, 67, 0.9));
        let block = Block::new(1, 0.0, long_events);
        let (mut path, mock, sink, transport) = fixture(block);
        transport.borrow_mut().set_playing(true);
        path.pump();
        mock.borrow_mut().set_transport(true, 0.1);
        path.pump();
        mock.borrow_mut().advance(0.0);
        transport.borrow_mut().set_playing(false);
        path.pump();
        let released = mock.borrow_mut().advance(0.0);
        let note_off = released.iter().any(|(_, _, msg)| matches!(msg, MidiMessage::NoteOff { .. }));
        assert!(note_off);
        let _ = sink;
    }

    #[test]
    fn disabled_track_ends_notes_without_scheduling() {
        let (mut path, mock, sink, transport) = fixture(note_block());
        transport.borrow_mut().set_playing(true);
        path.pump();
        path.track.borrow_mut().set_enabled(false);
        path.pump();
        assert!(!path.playing);
        let _ = (mock, sink);
    }

    #[test]
    fn initial_controller_values_replay_latest_before_start() {
        let mut events = EventList::new();
        events.duration = 4.0;
        events.insert_cc(CCSet { time: 0.0, controller: 7, value: 0.2 });
        events.insert_cc(CCSet { time: 1.0, controller: 7, value: 0.8 });
        let block = Block::new(1, 0.0, events);
        let (mut path, mock, sink, transport) = fixture(block);
        transport.borrow_mut().set_time(2.0);
        transport.borrow_mut().set_playing(true);
        path.pump();
        let released = mock.borrow_mut().advance(0.0);
        let replayed = released.iter().any(|(_, _, msg)| {
            matches!(msg, MidiMessage::Controller { controller, value }
                if controller.as_int() == 7 && value.as_int() == 102)
        });
        assert!(replayed, "expected the latest (not the first) CC value to be replayed");
        let _ = sink;
    }
}
