//! A track: an ordered sequence of [`Block`]s plus per-track state that
//! does not belong to any individual block (solo/mute/arm, naming maps,
//! bend range, last-observed controller values). Grounded on the source's
//! `track.rs` (flags, name) generalized from a single `Lane` to an ordered
//! `Block` sequence per the data model.

use std::collections::HashMap;

use crate::block::{Block, BlockId};
use crate::common::Seconds;
use crate::event::{ChannelId, ControllerId, Pitch};
use crate::notify::Notifier;
use crate::util::IdSeq;

pub type TrackId = u64;

#[derive(Debug, Default)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    blocks: Vec<Block>,
    block_id_seq: IdSeq,
    pub solo: bool,
    pub mute: bool,
    pub arm: bool,
    /// Set by the owning `TrackList`'s solo/mute recomputation; read-only
    /// from the track's own perspective.
    enabled: bool,
    pub pitch_names: HashMap<Pitch, String>,
    pub controller_names: HashMap<ControllerId, String>,
    pub bend_range: f32,
    pub controller_values: HashMap<ControllerId, f32>,
    /// Transient playback per-channel bend, used by PlaybackPath to avoid
    /// re-sending an unchanged bend message.
    channel_bends: HashMap<ChannelId, f32>,
    notifier: Notifier,
}

impl Track {
    pub fn new(id: TrackId, name: impl Into<String>) -> Track {
        Track {
            id,
            name: name.into(),
            blocks: Vec::new(),
            block_id_seq: IdSeq::new(0),
            solo: false,
            mute: false,
            arm: false,
            enabled: true,
            pitch_names: HashMap::new(),
            controller_names: HashMap::new(),
            bend_range: 6.0,
            controller_values: HashMap::new(),
            channel_bends: HashMap::new(),
            notifier: Notifier::default(),
        }
    }

    pub fn subscribe(&mut self, observer: impl FnMut() + Send + 'static) {
        self.notifier.subscribe(observer);
    }

    pub fn next_block_id(&self) -> BlockId {
        self.block_id_seq.next()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    pub fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
        self.notifier.notify();
    }

    pub fn remove_block(&mut self, id: BlockId) -> Option<Block> {
        let idx = self.blocks.iter().position(|b| b.id == id)?;
        let block = self.blocks.remove(idx);
        self.notifier.notify();
        Some(block)
    }

    pub fn replace_blocks(&mut self, blocks: Vec<Block>) {
        self.blocks = blocks;
        self.notifier.notify();
    }

    /// Derived: max over blocks of `time + duration`; 0.0 for an empty track.
    pub fn duration(&self) -> Seconds {
        self.blocks.iter().map(|b| b.end()).fold(0.0_f64, f64::max)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.notifier.notify();
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// True iff this track is armed and currently enabled: the condition
    /// under which RecordingPath should be live for it.
    pub fn previewing(&self) -> bool {
        self.arm && self.enabled
    }

    pub fn set_controller_value(&mut self, controller: ControllerId, value: f32) {
        self.controller_values.insert(controller, value);
    }

    pub fn channel_bend(&self, channel: ChannelId) -> f32 {
        self.channel_bends.get(&channel).copied().unwrap_or(0.0)
    }

    pub fn set_channel_bend(&mut self, channel: ChannelId, bend: f32) {
        self.channel_bends.insert(channel, bend);
    }

    pub fn clear_channel_bends(&mut self) {
        self.channel_bends.clear();
    }

    /// Block active at `t`, if any; used by RecordingPath to find the
    /// in-progress recording block and by PlaybackPath for overlap queries.
    pub fn block_at(&self, t: Seconds) -> Option<&Block> {
        self.blocks.iter().find(|b| b.contains_time(t))
    }

    pub fn block_at_mut(&mut self, t: Seconds) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.contains_time(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_list::EventList;

    fn block(id: BlockId, start: Seconds, duration: Seconds) -> Block {
        let mut events = EventList::new();
        events.duration = duration;
        Block::new(id, start, events)
    }

    #[test]
    fn duration_is_max_block_end() {
        let mut t = Track::new(1, "bass");
        t.push_block(block(1, 0.0, 2.0));
        t.push_block(block(2, 5.0, 1.0));
        assert_eq!(6.0, t.duration());
    }

    #[test]
    fn previewing_requires_armed_and_enabled() {
        let mut t = Track::new(1, "bass");
        assert!(!t.previewing());
        t.arm = true;
        assert!(t.previewing());
        t.set_enabled(false);
        assert!(!t.previewing());
    }

    #[test]
    fn default_bend_range_is_six_semitones() {
        let t = Track::new(1, "lead");
        assert_eq!(6.0, t.bend_range);
    }
}
