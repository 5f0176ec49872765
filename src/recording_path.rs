//! Per-track input handler: MIDI arriving on a track's sink port becomes
//! recorded [`Note`]/[`CCSet`] events in the track's in-progress block. No
//! direct teacher analogue (the source's `to_lane_events` converts a whole
//! parsed SMF track offline, not a live stream); grounded on the data model's
//! recording state machine and status-nibble table, reusing `to_lane_events`'s open-note
//! map idiom generalized to bend/aftertouch/CC reconstruction.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::warn;
use midly::MidiMessage;

use crate::block::{Block, BlockId};
use crate::common::Seconds;
use crate::event::{AftertouchPoint, BendPoint, CCSet, ChannelId, ControllerId, EventId, Note, Pitch};
use crate::event_list::EventList;
use crate::port_client::{PortHandle, SharedPortClient};
use crate::track_list::SharedTrack;
use crate::transport::Transport;

struct OpenNote {
    id: EventId,
    start_abs: Seconds,
    channel: ChannelId,
}

/// Decode a 14-bit MIDI pitch-bend value (centered at 8192) to semitones
/// given the track's bend range. Inverse of the encoding in `playback_path`.
pub fn decode_bend14(bend14: u16, bend_range: f32) -> f32 {
    (bend14 as f32 - 8192.0) * bend_range / 16384.0
}

pub struct RecordingPath {
    track: SharedTrack,
    port: SharedPortClient,
    transport: Rc<RefCell<Transport>>,
    sink_port: PortHandle,
    target_block: Option<BlockId>,
    open_notes: HashMap<Pitch, OpenNote>,
    channel_bends: HashMap<ChannelId, f32>,
    cc_seen_this_block: HashSet<ControllerId>,
    in_state_change: bool,
}

impl RecordingPath {
    pub fn new(
        track: SharedTrack,
        port: SharedPortClient,
        transport: Rc<RefCell<Transport>>,
        sink_port: PortHandle,
    ) -> RecordingPath {
        RecordingPath {
            track,
            port,
            transport,
            sink_port,
            target_block: None,
            open_notes: HashMap::new(),
            channel_bends: HashMap::new(),
            cc_seen_this_block: HashSet::new(),
            in_state_change: false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.target_block.is_some()
    }

    /// Run one pump cycle: react to arm/transport transitions, extend the
    /// in-progress block to the current transport time, then drain and
    /// apply any queued incoming MIDI.
    pub fn pump(&mut self) {
        self.on_state_change();
        if self.target_block.is_some() {
            let now = self.transport.borrow().time();
            self.extend_to(now);
        }
        self.drain_incoming();
    }

    /// Reentrancy-guarded: modifying the block we own can trigger
    /// an observer cascade back into this method.
    fn on_state_change(&mut self) {
        if self.in_state_change {
            return;
        }
        self.in_state_change = true;
        let should_record = {
            let track = self.track.borrow();
            track.arm && self.transport.borrow().is_recording()
        };
        match (should_record, self.target_block) {
            (true, None) => self.enter_record(),
            (false, Some(_)) => self.leave_record(),
            _ => {}
        }
        self.in_state_change = false;
    }

    fn enter_record(&mut self) {
        let now = self.transport.borrow().time();
        let mut track = self.track.borrow_mut();
        let id = track.next_block_id();
        let block = Block::new(id, now, EventList::new());
        track.push_block(block);
        drop(track);
        self.target_block = Some(id);
        self.open_notes.clear();
        self.channel_bends.clear();
        self.cc_seen_this_block.clear();
    }

    fn leave_record(&mut self) {
        self.drain_incoming();
        let now = self.transport.borrow().time();
        if let Some(block_id) = self.target_block.take() {
            let mut track = self.track.borrow_mut();
            if let Some(block) = track.blocks_mut().iter_mut().find(|b| b.id == block_id) {
                block.events.duration = (now - block.start).max(0.0);
                block.duration = block.events.duration;
            }
        }
        self.open_notes.clear();
        self.channel_bends.clear();
        self.cc_seen_this_block.clear();
    }

    fn extend_to(&mut self, now: Seconds) {
        let Some(block_id) = self.target_block else {
            return;
        };
        let mut track = self.track.borrow_mut();
        let Some(block) = track.blocks_mut().iter_mut().find(|b| b.id == block_id) else {
            return;
        };
        block.events.duration = (now - block.start).max(0.0);
        block.duration = block.events.duration;
        for open in self.open_notes.values() {
            if let Some(note) = block.events.note_mut(open.id) {
                note.duration = (now - open.start_abs).max(0.0);
            }
        }
    }

    fn drain_incoming(&mut self) {
        loop {
            let next = self.port.borrow_mut().receive(self.sink_port);
            let Some((channel, message, delta)) = next else {
                break;
            };
            self.elapsed_push(delta);
            let arrival = self.transport.borrow().time();
            self.handle_message(channel, message, arrival);
        }
    }

    /// Only the relative-arrival bookkeeping lives here; absolute arrival
    /// time is read off the transport directly, which in the mock/test
    /// setting is driven in lockstep with injected messages.
    fn elapsed_push(&mut self, _delta: Seconds) {}

    fn handle_message(&mut self, channel: ChannelId, message: MidiMessage, arrival: Seconds) {
        let Some(block_id) = self.target_block else {
            return;
        };
        let bend_range = self.track.borrow().bend_range;
        let mut track = self.track.borrow_mut();
        let Some(block) = track.blocks_mut().iter_mut().find(|b| b.id == block_id) else {
            return;
        };
        let local = (arrival - block.start).max(0.0);
        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                let pitch = key.as_int() as Pitch;
                let velocity = vel.as_int() as f32 / 127.0;
                let mut note = Note::new(local, 0.0, pitch, velocity);
                note.channel = channel;
                let bend = self.channel_bends.get(&channel).copied().unwrap_or(0.0);
                if bend != 0.0 {
                    note.bend.push(BendPoint {
                        time_offset: 0.0,
                        semitones: bend,
                    });
                }
                let id = block.events.insert_note(note);
                self.open_notes.insert(
                    pitch,
                    OpenNote {
                        id,
                        start_abs: arrival,
                        channel,
                    },
                );
            }
            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                let pitch = key.as_int() as Pitch;
                if let Some(open) = self.open_notes.remove(&pitch) {
                    let duration = (arrival - open.start_abs).max(0.0);
                    if let Some(note) = block.events.note_mut(open.id) {
                        note.duration = duration;
                        note.cap_curves();
                    }
                } else {
                    warn!("note-off for pitch {pitch} with no matching open note");
                }
            }
            MidiMessage::Aftertouch { key, vel } => {
                let pitch = key.as_int() as Pitch;
                if let Some(open) = self.open_notes.get(&pitch) {
                    let offset = (arrival - open.start_abs).max(0.0);
                    if let Some(note) = block.events.note_mut(open.id) {
                        if note.aftertouch.is_empty() {
                            note.aftertouch.push(AftertouchPoint {
                                time_offset: 0.0,
                                velocity: note.velocity,
                            });
                        }
                        note.aftertouch.push(AftertouchPoint {
                            time_offset: offset,
                            velocity: vel.as_int() as f32 / 127.0,
                        });
                    }
                }
            }
            MidiMessage::PitchBend { bend } => {
                let semitones = decode_bend14(bend.as_int(), bend_range);
                self.channel_bends.insert(channel, semitones);
                for open in self.open_notes.values().filter(|o| o.channel == channel) {
                    let offset = (arrival - open.start_abs).max(0.0);
                    if let Some(note) = block.events.note_mut(open.id) {
                        if note.bend.is_empty() {
                            note.bend.push(BendPoint {
                                time_offset: 0.0,
                                semitones: 0.0,
                            });
                        }
                        note.bend.push(BendPoint {
                            time_offset: offset,
                            semitones,
                        });
                    }
                }
            }
            MidiMessage::Controller { controller, value } => {
                let id = controller.as_int() as ControllerId;
                let v = value.as_int() as f32 / 127.0;
                let is_first = !block.events.has_controller(id);
                block.events.insert_cc(CCSet {
                    time: local,
                    controller: id,
                    value: v,
                });
                if is_first {
                    block.events.insert_cc(CCSet {
                        time: 0.0,
                        controller: id,
                        value: v,
                    });
                }
                self.cc_seen_this_block.insert(id);
                drop(track);
                self.track.borrow_mut().set_controller_value(id, v);
                return;
            }
            other => {
                warn!("ignoring unsupported message kind on recording path: {other:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_client::{MockPortClient, PortDirection};
    use crate::track::Track;
    use crate::unit::PortTypeTag;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Fixture {
        path: RecordingPath,
        mock: Rc<RefCell<MockPortClient>>,
        transport: Rc<RefCell<Transport>>,
        track: SharedTrack,
        sink: PortHandle,
    }

    fn setup() -> Fixture {
        let mock = Rc::new(RefCell::new(MockPortClient::new()));
        let port: SharedPortClient = mock.clone();
        let sink = port
            .borrow_mut()
            .open_port("track-in", PortDirection::Input, PortTypeTag::Midi)
            .unwrap();
        let transport = Rc::new(RefCell::new(Transport::new(port.clone())));
        let track = Rc::new(RefCell::new(Track::new(1, "lead")));
        let path = RecordingPath::new(track.clone(), port, transport.clone(), sink);
        Fixture { path, mock, transport, track, sink }
    }

    #[test]
    fn recording_a_note_creates_a_block_with_one_note() {
        let mut f = setup();
        f.track.borrow_mut().arm = true;
        f.transport.borrow_mut().set_recording(true);
        f.mock.borrow_mut().set_transport(true, 0.0);
        f.mock
            .borrow_mut()
            .push_incoming(f.sink, 0, MidiMessage::NoteOn { key: 60.into(), vel: 100.into() }, 0.0);
        f.path.pump();
        f.mock.borrow_mut().set_transport(true, 0.5);
        f.mock
            .borrow_mut()
            .push_incoming(f.sink, 0, MidiMessage::NoteOff { key: 60.into(), vel: 0.into() }, 0.5);
        f.path.pump();
        let track = f.track.borrow();
        assert_eq!(1, track.blocks().len());
        assert_eq!(1, track.blocks()[0].events.len());
    }

    #[test]
    fn unmatched_note_off_is_ignored_without_panicking() {
        let mut f = setup();
        f.track.borrow_mut().arm = true;
        f.transport.borrow_mut().set_recording(true);
        f.mock.borrow_mut().set_transport(true, 0.0);
        f.mock
            .borrow_mut()
            .push_incoming(f.sink, 0, MidiMessage::NoteOff { key: 60.into(), vel: 0.into() }, 0.0);
        f.path.pump();
        assert!(f.track.borrow().blocks()[0].events.is_empty());
    }

    #[test]
    fn first_cc_in_a_block_is_backfilled_at_time_zero() {
        let mut f = setup();
        f.track.borrow_mut().arm = true;
        f.transport.borrow_mut().set_recording(true);
        f.mock.borrow_mut().set_transport(true, 1.0);
        f.mock.borrow_mut().push_incoming(
            f.sink,
            0,
            MidiMessage::Controller { controller: 7.into(), value: 80.into() },
            1.0,
        );
        f.path.pump();
        let track = f.track.borrow();
        let events = track.blocks()[0].events.events();
        assert_eq!(2, events.len());
        assert_eq!(0.0, events[0].time());
    }

    #[test]
    fn leaving_record_finalizes_block_duration() {
        let mut f = setup();
        f.track.borrow_mut().arm = true;
        f.transport.borrow_mut().set_recording(true);
        f.mock.borrow_mut().set_transport(true, 0.0);
        f.path.pump();
        f.mock.borrow_mut().set_transport(true, 2.0);
        f.transport.borrow_mut().set_recording(false);
        f.path.pump();
        assert_eq!(2.0, f.track.borrow().blocks()[0].events.duration);
    }
}
