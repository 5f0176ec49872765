//! A placement of an `EventList` on a track's timeline, with optional
//! repetition. Grounded on the source's pattern of a movable, possibly
//! looping region (`track.rs`'s lane placement) generalized to the data
//! model's `Block`/`BlockHandle` vocabulary.

use crate::common::Seconds;
use crate::event_list::EventList;
use crate::util::{range_contains, ranges_intersect, Range};

pub type BlockId = u64;

/// Which draggable handle of a block a UI gesture is manipulating. The core
/// does not interpret drags itself; it only exposes the geometry so a caller
/// can compute the new `start`/`duration` to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHandle {
    Start,
    End,
    Repeat(u32),
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub start: Seconds,
    pub events: EventList,
    /// The block's own length, independent of `events.duration`. If it
    /// exceeds the event list's duration, the event list repeats from time
    /// zero until the block ends; the final repeat is truncated rather than
    /// padded out to a whole period.
    pub duration: Seconds,
}

impl Block {
    /// A block that plays its event list through exactly once.
    pub fn new(id: BlockId, start: Seconds, events: EventList) -> Block {
        let duration = events.duration;
        Block { id, start, events, duration }
    }

    pub fn period(&self) -> Seconds {
        self.events.duration
    }

    pub fn end(&self) -> Seconds {
        self.start + self.duration
    }

    pub fn span(&self) -> Range<Seconds> {
        (self.start, self.end())
    }

    pub fn intersects(&self, other: &Range<Seconds>) -> bool {
        ranges_intersect(&self.span(), other)
    }

    pub fn contains_time(&self, t: Seconds) -> bool {
        range_contains(&self.span(), t)
    }

    /// Number of times the event list's period starts within the block's
    /// duration, including a truncated final repeat. 1 for a zero-period
    /// event list (nothing to repeat).
    pub fn repeat_count(&self) -> u32 {
        let period = self.period();
        if period <= 0.0 {
            return 1;
        }
        (self.duration / period).ceil().max(1.0) as u32
    }

    /// Start time of each repeat, including the first, relative to the
    /// track's timeline. The last entry may be a partial repeat.
    pub fn repeat_starts(&self) -> Vec<Seconds> {
        let period = self.period();
        if period <= 0.0 {
            return vec![self.start];
        }
        let mut starts = Vec::new();
        let mut t = 0.0;
        while t < self.duration {
            starts.push(self.start + t);
            t += period;
        }
        starts
    }

    /// All the distinct times a block presents to the track's "snap to
    /// nearby event" query: each repeat's event times, offset into the
    /// block's own timeline, dropped once they fall past `duration` (the
    /// truncated tail of a partial final repeat).
    pub fn times(&mut self) -> Vec<Seconds> {
        let starts = self.repeat_starts();
        let local = self.events.times().to_vec();
        let start = self.start;
        let duration = self.duration;
        starts
            .into_iter()
            .flat_map(|s| {
                local
                    .iter()
                    .filter(move |t| (s - start) + **t < duration)
                    .map(move |t| s + t)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn snap_times(&self) -> Vec<Seconds> {
        let starts = self.repeat_starts();
        let local = self.events.snap_times();
        let start = self.start;
        let duration = self.duration;
        starts
            .into_iter()
            .flat_map(|s| {
                local
                    .iter()
                    .filter(move |t| (s - start) + **t < duration)
                    .map(move |t| s + t)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn handle_set(&self) -> Vec<BlockHandle> {
        let mut handles = vec![BlockHandle::Start, BlockHandle::End];
        for i in 1..self.repeat_count() {
            handles.push(BlockHandle::Repeat(i));
        }
        handles
    }
}

/// Merge `a` and `b` into one block if they are adjacent repeats of the same
/// period (i.e. `b.start == a.end()` and both share `a.period()`); otherwise
/// `None`. The merged block keeps `a`'s id and event list, and its duration
/// grows to cover both.
pub fn join_repeats(mut a: Block, b: &Block) -> Option<Block> {
    if (a.end() - b.start).abs() > f64::EPSILON || (a.period() - b.period()).abs() > f64::EPSILON
    {
        return None;
    }
    a.duration += b.duration;
    Some(a)
}

/// Merge two blocks with distinct event content into a single block whose
/// event list is the concatenation, `b`'s events offset by the gap between
/// them. Used when the track wants one contiguous block rather than two.
pub fn join(a: Block, b: Block) -> Block {
    let offset = b.start - a.start;
    let mut merged_events = a.events;
    merged_events.begin_change();
    for ev in b.events.events().to_vec() {
        match ev.event {
            crate::event::Event::Note(mut n) => {
                n.start += offset;
                merged_events.append_note(n);
            }
            crate::event::Event::CC(mut c) => {
                c.time += offset;
                merged_events.append_cc(c);
            }
        }
    }
    merged_events.end_change();
    let duration = merged_events.duration;
    Block {
        id: a.id,
        start: a.start,
        events: merged_events,
        duration,
    }
}

/// Split a repeating block at repeat boundary `at_repeat` (1..repeat_count)
/// into two blocks that share the same event list content but start fresh
/// durations. `next_id` supplies the id for the new trailing block.
pub fn split_repeats(block: Block, at_repeat: u32, next_id: BlockId) -> (Block, Option<Block>) {
    let period = block.period();
    if period <= 0.0 || at_repeat == 0 || at_repeat >= block.repeat_count() {
        return (block, None);
    }
    let cut = period * at_repeat as f64;
    let tail_start = block.start + cut;
    let tail_duration = block.duration - cut;
    let id = block.id;
    let start = block.start;
    let tail = Block {
        id: next_id,
        start: tail_start,
        events: clone_event_list(&block.events),
        duration: tail_duration,
    };
    let head = Block {
        id,
        start,
        events: block.events,
        duration: cut,
    };
    (head, Some(tail))
}

/// Split a block's single event list content at time `at` (relative to
/// `block.start`), distributing events by which side of the cut they fall
/// on. Only meaningful for non-repeating blocks; repeating blocks should be
/// split with [`split_repeats`] first.
pub fn split(block: Block, at: Seconds, next_id: BlockId) -> (Block, Block) {
    let start = block.start;
    let id = block.id;
    let mut head_events = EventList::new();
    let mut tail_events = EventList::new();
    head_events.divisions = block.events.divisions;
    tail_events.divisions = block.events.divisions;
    for ev in block.events.events().to_vec() {
        match ev.event {
            crate::event::Event::Note(n) if n.start < at => head_events.append_note(n),
            crate::event::Event::Note(mut n) => {
                n.start -= at;
                tail_events.append_note(n);
            }
            crate::event::Event::CC(c) if c.time < at => head_events.append_cc(c),
            crate::event::Event::CC(mut c) => {
                c.time -= at;
                tail_events.append_cc(c);
            }
        }
    }
    head_events.duration = at;
    tail_events.duration = block.events.duration - at;
    let head_duration = head_events.duration;
    let tail_duration = tail_events.duration;
    (
        Block {
            id,
            start,
            events: head_events,
            duration: head_duration,
        },
        Block {
            id: next_id,
            start: start + at,
            events: tail_events,
            duration: tail_duration,
        },
    )
}

fn clone_event_list(source: &EventList) -> EventList {
    let mut clone = EventList::new();
    clone.divisions = source.divisions;
    clone.duration = source.duration;
    for ev in source.events() {
        match ev.event.clone() {
            crate::event::Event::Note(n) => {
                clone.append_note(n);
            }
            crate::event::Event::CC(c) => {
                clone.append_cc(c);
            }
        }
    }
    clone
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Note;
    use proptest::prelude::*;

    fn events_with_duration(duration: Seconds) -> EventList {
        let mut e = EventList::new();
        e.duration = duration;
        e
    }

    proptest! {
        #[test]
        fn split_then_rejoin_preserves_note_count(
            cut in 0.1f64..1.9,
            starts in prop::collection::vec(0.0f64..2.0, 1..8),
        ) {
            let mut events = events_with_duration(2.0);
            for (i, start) in starts.iter().enumerate() {
                events.append_note(Note::new(*start, 0.05, 60 + (i as u8 % 20), 0.5));
            }
            let total_before = events.len();
            let block = Block::new(1, 0.0, events);
            let (head, tail) = split(block, cut, 2);
            prop_assert_eq!(total_before, head.events.len() + tail.events.len());
            let rejoined = join(head, tail);
            prop_assert_eq!(total_before, rejoined.events.len());
        }
    }

    #[test]
    fn end_accounts_for_duration_past_one_period() {
        let mut b = Block::new(1, 0.0, events_with_duration(2.0));
        b.duration = 6.0;
        assert_eq!(6.0, b.end());
    }

    #[test]
    fn duration_not_a_whole_multiple_of_period_allows_partial_final_repeat() {
        let mut b = Block::new(1, 0.0, events_with_duration(2.0));
        b.duration = 5.0;
        assert_eq!(5.0, b.end());
        assert_eq!(3, b.repeat_count());
        assert_eq!(vec![0.0, 2.0, 4.0], b.repeat_starts());
    }

    #[test]
    fn join_repeats_merges_adjacent_same_period() {
        let a = Block::new(1, 0.0, events_with_duration(2.0));
        let mut b = Block::new(2, 2.0, events_with_duration(2.0));
        b.duration = 4.0;
        let merged = join_repeats(a, &b).expect("should merge");
        assert_eq!(6.0, merged.duration);
        assert_eq!(3, merged.repeat_count());
    }

    #[test]
    fn join_repeats_rejects_non_adjacent() {
        let a = Block::new(1, 0.0, events_with_duration(2.0));
        let b = Block::new(2, 3.0, events_with_duration(2.0));
        assert!(join_repeats(a, &b).is_none());
    }

    #[test]
    fn split_distributes_events_by_cut_time() {
        let mut events = events_with_duration(2.0);
        events.append_note(Note::new(0.2, 0.1, 60, 0.5));
        events.append_note(Note::new(1.5, 0.1, 64, 0.5));
        let block = Block::new(1, 0.0, events);
        let (head, tail) = split(block, 1.0, 2);
        assert_eq!(1, head.events.len());
        assert_eq!(1, tail.events.len());
        assert_eq!(0.5, tail.events.events()[0].time());
    }

    #[test]
    fn split_repeats_divides_duration_at_a_period_boundary() {
        let mut b = Block::new(1, 0.0, events_with_duration(1.0));
        b.duration = 4.0;
        let (head, tail) = split_repeats(b, 2, 9);
        assert_eq!(2.0, head.duration);
        let tail = tail.expect("split should produce a tail");
        assert_eq!(2.0, tail.duration);
        assert_eq!(2.0, tail.start);
        assert_eq!(9, tail.id);
    }
}
