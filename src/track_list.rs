//! Ordered sequence of tracks sharing one `Transport`. Owns the global
//! solo/mute resolution: if any track is solo, only solo tracks are
//! enabled; otherwise every non-muted track is enabled. Grounded on the
//! source's single flat `Vec<Lane>` ownership in `app.rs`, generalized to
//! the data model's `Track`/solo-mute semantics. Tracks are held behind
//! `Rc<RefCell<_>>` since `RecordingPath`/`PlaybackPath` each need their
//! own handle to the same track, matching this crate's single-task, no-lock
//! sharing model.

use std::cell::RefCell;
use std::rc::Rc;

use crate::block::{self, BlockId};
use crate::common::Seconds;
use crate::notify::Notifier;
use crate::track::{Track, TrackId};
use crate::transport::Transport;
use crate::util::IdSeq;

pub type SharedTrack = Rc<RefCell<Track>>;

#[derive(Debug)]
pub struct TrackList {
    tracks: Vec<SharedTrack>,
    track_id_seq: IdSeq,
    transport: Rc<RefCell<Transport>>,
    notifier: Notifier,
}

impl TrackList {
    pub fn new(transport: Rc<RefCell<Transport>>) -> TrackList {
        TrackList {
            tracks: Vec::new(),
            track_id_seq: IdSeq::new(0),
            transport,
            notifier: Notifier::default(),
        }
    }

    pub fn subscribe(&mut self, observer: impl FnMut() + Send + 'static) {
        self.notifier.subscribe(observer);
    }

    pub fn transport(&self) -> Rc<RefCell<Transport>> {
        self.transport.clone()
    }

    pub fn tracks(&self) -> &[SharedTrack] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<SharedTrack> {
        self.tracks.iter().find(|t| t.borrow().id == id).cloned()
    }

    pub fn add_track(&mut self, name: impl Into<String>) -> TrackId {
        let id = self.track_id_seq.next();
        self.tracks.push(Rc::new(RefCell::new(Track::new(id, name))));
        self.recompute_enabled();
        self.notifier.notify();
        id
    }

    pub fn remove_track(&mut self, id: TrackId) -> Option<SharedTrack> {
        let idx = self.tracks.iter().position(|t| t.borrow().id == id)?;
        let track = self.tracks.remove(idx);
        self.recompute_enabled();
        self.notifier.notify();
        Some(track)
    }

    /// Call after any change to a track's `solo`/`mute` flag.
    pub fn recompute_enabled(&mut self) {
        let any_solo = self.tracks.iter().any(|t| t.borrow().solo);
        for track in self.tracks.iter() {
            let mut track = track.borrow_mut();
            let enabled = if any_solo { track.solo } else { !track.mute };
            track.set_enabled(enabled);
        }
    }

    pub fn set_solo(&mut self, id: TrackId, solo: bool) {
        if let Some(track) = self.track(id) {
            track.borrow_mut().solo = solo;
        }
        self.recompute_enabled();
    }

    pub fn set_mute(&mut self, id: TrackId, mute: bool) {
        if let Some(track) = self.track(id) {
            track.borrow_mut().mute = mute;
        }
        self.recompute_enabled();
    }

    /// Merge `block_ids` (all belonging to tracks in this list) into a
    /// single block appended to `into_track`; sources are removed.
    pub fn join_blocks(&mut self, block_ids: &[(TrackId, BlockId)], into_track: TrackId) {
        let mut gathered = Vec::new();
        for (track_id, block_id) in block_ids {
            if let Some(track) = self.track(*track_id) {
                if let Some(b) = track.borrow_mut().remove_block(*block_id) {
                    gathered.push(b);
                }
            }
        }
        gathered.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());
        let mut iter = gathered.into_iter();
        let Some(mut merged) = iter.next() else {
            return;
        };
        for next in iter {
            merged = block::join(merged, next);
        }
        if let Some(track) = self.track(into_track) {
            track.borrow_mut().push_block(merged);
        }
        self.notifier.notify();
    }

    pub fn split_block_repeats(&mut self, track_id: TrackId, block_id: BlockId, at_repeat: u32) {
        let Some(track) = self.track(track_id) else {
            return;
        };
        let mut track = track.borrow_mut();
        let Some(b) = track.remove_block(block_id) else {
            return;
        };
        let next_id = track.next_block_id();
        let (head, tail) = block::split_repeats(b, at_repeat, next_id);
        track.push_block(head);
        if let Some(tail) = tail {
            track.push_block(tail);
        }
        drop(track);
        self.notifier.notify();
    }

    pub fn split_block(&mut self, track_id: TrackId, block_id: BlockId, at: Seconds) {
        let Some(track) = self.track(track_id) else {
            return;
        };
        let mut track = track.borrow_mut();
        let Some(b) = track.remove_block(block_id) else {
            return;
        };
        let next_id = track.next_block_id();
        let (head, tail) = block::split(b, at, next_id);
        track.push_block(head);
        track.push_block(tail);
        drop(track);
        self.notifier.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_client::{MockPortClient, SharedPortClient};

    fn fresh_list() -> TrackList {
        let port: SharedPortClient = Rc::new(RefCell::new(MockPortClient::new()));
        let transport = Rc::new(RefCell::new(Transport::new(port)));
        TrackList::new(transport)
    }

    #[test]
    fn solo_disables_non_solo_tracks() {
        let mut list = fresh_list();
        let a = list.add_track("a");
        let b = list.add_track("b");
        list.set_solo(a, true);
        assert!(list.track(a).unwrap().borrow().enabled());
        assert!(!list.track(b).unwrap().borrow().enabled());
    }

    #[test]
    fn mute_disables_without_solo() {
        let mut list = fresh_list();
        let a = list.add_track("a");
        let b = list.add_track("b");
        list.set_mute(a, true);
        assert!(!list.track(a).unwrap().borrow().enabled());
        assert!(list.track(b).unwrap().borrow().enabled());
    }

    #[test]
    fn unsolo_last_track_reenables_everyone() {
        let mut list = fresh_list();
        let a = list.add_track("a");
        let b = list.add_track("b");
        list.set_solo(a, true);
        list.set_solo(a, false);
        assert!(list.track(a).unwrap().borrow().enabled());
        assert!(list.track(b).unwrap().borrow().enabled());
    }
}
