//! Ordered-by-time sequence of events with eagerly maintained pitch/
//! controller reference-counted indices and a lazily rebuilt sorted-time
//! view. Grounded on `lane.rs`'s `Lane` (sorted `Vec<LaneEvent>`,
//! `partition_point`-based insert, `cc_value_at`) generalized to carry the
//! three derived indices the data model asks for.

use std::collections::{BTreeSet, HashMap};

use ordered_float::OrderedFloat;

use crate::common::Seconds;
use crate::event::{CCSet, ControllerId, Event, EventId, Note, Pitch, TimedEvent};
use crate::notify::Notifier;
use crate::util::IdSeq;

#[derive(Default)]
pub struct EventList {
    /// Kept sorted by time; see `dirty_order`.
    events: Vec<TimedEvent>,
    dirty_order: bool,
    /// Repeat period; see `Block`.
    pub duration: Seconds,
    /// UI snap-grid hint, unused by the core itself.
    pub divisions: u32,
    pitch_refs: HashMap<Pitch, u32>,
    controller_refs: HashMap<ControllerId, u32>,
    controller_events: HashMap<ControllerId, Vec<(Seconds, EventId)>>,
    times_cache: Option<Vec<Seconds>>,
    id_seq: IdSeq,
    notifier: Notifier,
}

impl std::fmt::Debug for EventList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventList")
            .field("events", &self.events)
            .field("duration", &self.duration)
            .field("divisions", &self.divisions)
            .finish()
    }
}

impl EventList {
    pub fn new() -> EventList {
        EventList::default()
    }

    pub fn subscribe(&mut self, observer: impl FnMut() + Send + 'static) {
        self.notifier.subscribe(observer);
    }

    pub fn begin_change(&mut self) {
        self.notifier.begin_change();
    }

    pub fn end_change(&mut self) {
        self.notifier.end_change();
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_controller(&self, id: ControllerId) -> bool {
        self.controller_refs.get(&id).copied().unwrap_or(0) > 0
    }

    pub fn pitches(&self) -> impl Iterator<Item = &Pitch> {
        self.pitch_refs.keys()
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ControllerId> {
        self.controller_refs.keys()
    }

    pub fn insert_note(&mut self, note: Note) -> EventId {
        let id = self.id_seq.next();
        *self.pitch_refs.entry(note.pitch).or_insert(0) += 1;
        self.insert_sorted(TimedEvent {
            id,
            selected: false,
            event: Event::Note(note),
        });
        self.notifier.notify();
        id
    }

    pub fn insert_cc(&mut self, cc: CCSet) -> EventId {
        let id = self.id_seq.next();
        *self.controller_refs.entry(cc.controller).or_insert(0) += 1;
        let per_controller = self.controller_events.entry(cc.controller).or_default();
        let idx = per_controller.partition_point(|(t, _)| *t < cc.time);
        per_controller.insert(idx, (cc.time, id));
        self.insert_sorted(TimedEvent {
            id,
            selected: false,
            event: Event::CC(cc),
        });
        self.notifier.notify();
        id
    }

    /// Append without maintaining sort order eagerly; a subsequent read
    /// triggers a lazy resort. Used by bulk load from recorded/parsed
    /// events which mostly arrive already in time order.
    pub fn append_note(&mut self, note: Note) -> EventId {
        let id = self.id_seq.next();
        *self.pitch_refs.entry(note.pitch).or_insert(0) += 1;
        self.append(TimedEvent {
            id,
            selected: false,
            event: Event::Note(note),
        });
        id
    }

    pub fn append_cc(&mut self, cc: CCSet) -> EventId {
        let id = self.id_seq.next();
        *self.controller_refs.entry(cc.controller).or_insert(0) += 1;
        let per_controller = self.controller_events.entry(cc.controller).or_default();
        per_controller.push((cc.time, id));
        self.append(TimedEvent {
            id,
            selected: false,
            event: Event::CC(cc),
        });
        id
    }

    pub fn remove(&mut self, id: EventId) -> Option<TimedEvent> {
        let idx = self.events.iter().position(|e| e.id == id)?;
        let ev = self.events.remove(idx);
        match &ev.event {
            Event::Note(n) => {
                if let Some(count) = self.pitch_refs.get_mut(&n.pitch) {
                    *count -= 1;
                    if *count == 0 {
                        self.pitch_refs.remove(&n.pitch);
                    }
                }
            }
            Event::CC(c) => {
                if let Some(count) = self.controller_refs.get_mut(&c.controller) {
                    *count -= 1;
                    if *count == 0 {
                        self.controller_refs.remove(&c.controller);
                        self.controller_events.remove(&c.controller);
                    } else if let Some(list) = self.controller_events.get_mut(&c.controller) {
                        list.retain(|(_, eid)| *eid != id);
                    }
                }
            }
        }
        self.invalidate_times();
        self.notifier.notify();
        Some(ev)
    }

    fn insert_sorted(&mut self, ev: TimedEvent) {
        self.ensure_sorted();
        let idx = self
            .events
            .partition_point(|e| e.time() <= ev.time());
        self.events.insert(idx, ev);
        self.invalidate_times();
    }

    fn append(&mut self, ev: TimedEvent) {
        let out_of_order = self
            .events
            .last()
            .map(|last| last.time() > ev.time())
            .unwrap_or(false);
        self.events.push(ev);
        if out_of_order {
            self.dirty_order = true;
        }
        self.invalidate_times();
        self.notifier.notify();
    }

    fn ensure_sorted(&mut self) {
        if self.dirty_order {
            self.events.sort_by(|a, b| {
                a.time()
                    .partial_cmp(&b.time())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            self.dirty_order = false;
        }
    }

    fn invalidate_times(&mut self) {
        self.times_cache = None;
    }

    /// All distinct event times, sorted ascending.
    pub fn times(&mut self) -> &[Seconds] {
        self.ensure_sorted();
        if self.times_cache.is_none() {
            let set: BTreeSet<OrderedFloat<Seconds>> =
                self.events.iter().map(|e| OrderedFloat(e.time())).collect();
            self.times_cache = Some(set.into_iter().map(|t| t.0).collect());
        }
        self.times_cache.as_deref().unwrap()
    }

    /// Like `times`, but events currently flagged `selected` are excluded;
    /// snapping should not snap to the thing being dragged.
    pub fn snap_times(&self) -> Vec<Seconds> {
        let set: BTreeSet<OrderedFloat<Seconds>> = self
            .events
            .iter()
            .filter(|e| !e.selected)
            .map(|e| OrderedFloat(e.time()))
            .collect();
        set.into_iter().map(|t| t.0).collect()
    }

    /// Direct mutable access to a still-open note's curves/duration while
    /// it is being recorded. Does not affect derived indices since pitch
    /// and start time are not touched by the caller's intended use.
    pub fn note_mut(&mut self, id: EventId) -> Option<&mut Note> {
        self.events.iter_mut().find(|e| e.id == id).and_then(|e| match &mut e.event {
            Event::Note(n) => Some(n),
            _ => None,
        })
    }

    /// Latest CC value for `controller` at or before `at`, or 0.0 if none.
    pub fn cc_value_at(&self, at: Seconds, controller: ControllerId) -> f32 {
        let Some(list) = self.controller_events.get(&controller) else {
            return 0.0;
        };
        let idx = list.partition_point(|(t, _)| *t <= at);
        if idx == 0 {
            0.0
        } else {
            let (_, id) = list[idx - 1];
            self.events
                .iter()
                .find(|e| e.id == id)
                .and_then(|e| match &e.event {
                    Event::CC(cc) => Some(cc.value),
                    _ => None,
                })
                .unwrap_or(0.0)
        }
    }
}
