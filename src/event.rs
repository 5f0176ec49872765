//! Notes and control-change setpoints, the two event kinds an `EventList`
//! holds. Grounded on `track.rs`/`lane.rs`'s `Note`/`ControllerSetValue`
//! split, generalized from integer tick/microsecond time to seconds and
//! from fixed-velocity notes to bend/aftertouch curves per the data model.

use crate::common::{Seconds, PITCH_SLOP_SEMITONES};

pub type Pitch = u8;
pub type ControllerId = u8;
pub type ChannelId = u8;
pub type EventId = u64;

pub const MIDI_CC_MODWHEEL: ControllerId = 1;
pub const MIDI_CC_SUSTAIN: ControllerId = 64;

/// Pianoteq-style continuous damper values are not modeled; this is the
/// binary on/off threshold used by sustain-pedal reconstruction.
pub fn is_cc_switch_on(value: f32) -> bool {
    value >= 0.5
}

/// One sample of a note's pitch-bend curve, relative to the note's start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BendPoint {
    pub time_offset: Seconds,
    pub semitones: f32,
}

/// One sample of a note's polyphonic-aftertouch curve, relative to the
/// note's start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AftertouchPoint {
    pub time_offset: Seconds,
    pub velocity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// Since the owning event list's origin.
    pub start: Seconds,
    pub duration: Seconds,
    pub pitch: Pitch,
    /// 0.0 - 1.0
    pub velocity: f32,
    pub bend: Vec<BendPoint>,
    pub aftertouch: Vec<AftertouchPoint>,
    /// Transient channel assignment, valid only during the record/playback
    /// session that set it; not part of the persisted identity of the note.
    pub channel: ChannelId,
}

impl Note {
    pub fn new(start: Seconds, duration: Seconds, pitch: Pitch, velocity: f32) -> Note {
        Note {
            start,
            duration,
            pitch,
            velocity,
            bend: Vec::new(),
            aftertouch: Vec::new(),
            channel: 0,
        }
    }

    /// Lowest pitch row this note can visually claim, extending the base
    /// pitch by the bend curve's most negative excursion, with slop so a
    /// microbend does not claim an extra row.
    pub fn min_pitch(&self) -> Pitch {
        let lowest = self
            .bend
            .iter()
            .map(|b| b.semitones)
            .fold(0.0_f32, f32::min);
        if lowest < -PITCH_SLOP_SEMITONES {
            (self.pitch as f32 + lowest).floor().max(0.0) as Pitch
        } else {
            self.pitch
        }
    }

    pub fn max_pitch(&self) -> Pitch {
        let highest = self
            .bend
            .iter()
            .map(|b| b.semitones)
            .fold(0.0_f32, f32::max);
        if highest > PITCH_SLOP_SEMITONES {
            (self.pitch as f32 + highest).ceil().min(127.0) as Pitch
        } else {
            self.pitch
        }
    }

    /// After note-off, cap the bend/aftertouch curves with a terminal
    /// sample at `t = duration` so a synth does not keep interpolating past
    /// the note's end. A no-op on an empty curve.
    pub fn cap_curves(&mut self) {
        if let Some(last) = self.bend.last().copied() {
            if last.time_offset < self.duration {
                self.bend.push(BendPoint {
                    time_offset: self.duration,
                    semitones: last.semitones,
                });
            }
        }
        if let Some(last) = self.aftertouch.last().copied() {
            if last.time_offset < self.duration {
                self.aftertouch.push(AftertouchPoint {
                    time_offset: self.duration,
                    velocity: last.velocity,
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CCSet {
    pub time: Seconds,
    pub controller: ControllerId,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Note(Note),
    CC(CCSet),
}

impl Event {
    pub fn time(&self) -> Seconds {
        match self {
            Event::Note(n) => n.start,
            Event::CC(c) => c.time,
        }
    }
}

/// An event plus its identity and selection flag. Selection is a UI concern
/// but the core must honor it when computing snap candidates (`snap_times`).
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    pub id: EventId,
    pub selected: bool,
    pub event: Event,
}

impl TimedEvent {
    pub fn time(&self) -> Seconds {
        self.event.time()
    }
}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.time().partial_cmp(&other.time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn cap_curves_never_leaves_a_sample_past_duration(
            duration in 0.01f64..10.0,
            bend_offset in 0.0f64..10.0,
            semitones in -6.0f32..6.0,
        ) {
            let mut n = Note::new(0.0, duration, 60, 0.8);
            n.bend.push(BendPoint { time_offset: bend_offset.min(duration), semitones });
            n.cap_curves();
            for b in &n.bend {
                prop_assert!(b.time_offset <= n.duration + 1e-9);
            }
        }
    }

    #[test]
    fn microbend_does_not_extend_pitch_row() {
        let mut n = Note::new(0.0, 1.0, 60, 0.8);
        n.bend.push(BendPoint {
            time_offset: 0.0,
            semitones: 0.05,
        });
        assert_eq!(60, n.min_pitch());
        assert_eq!(60, n.max_pitch());
    }

    #[test]
    fn large_bend_extends_pitch_row() {
        let mut n = Note::new(0.0, 1.0, 60, 0.8);
        n.bend.push(BendPoint {
            time_offset: 0.0,
            semitones: -1.3,
        });
        n.bend.push(BendPoint {
            time_offset: 0.5,
            semitones: 2.2,
        });
        assert_eq!(58, n.min_pitch());
        assert_eq!(63, n.max_pitch());
    }

    #[test]
    fn cap_curves_adds_terminal_sample() {
        let mut n = Note::new(0.0, 0.75, 60, 0.8);
        n.bend.push(BendPoint {
            time_offset: 0.2,
            semitones: 1.0,
        });
        n.cap_curves();
        assert_eq!(2, n.bend.len());
        assert_eq!(0.75, n.bend.last().unwrap().time_offset);
        assert_eq!(1.0, n.bend.last().unwrap().semitones);
    }

    #[test]
    fn cap_curves_is_noop_on_empty_curve() {
        let mut n = Note::new(0.0, 0.75, 60, 0.8);
        n.cap_curves();
        assert!(n.bend.is_empty());
        assert!(n.aftertouch.is_empty());
    }
}
