//! Persisted form of the data model: a serde tree independent of the live
//! `Rc<RefCell<_>>`/`Notifier`-bearing runtime types, round-tripped through
//! `rmp-serde` for the document body and `toml` for a small metadata header.
//! Grounded on `project.rs`'s `ProjectMeta`/toml pattern, generalized from a
//! single metadata record to the full entity tree named in the data model.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockId};
use crate::common::Seconds;
use crate::error::{CoreError, CoreResult};
use crate::event::{AftertouchPoint, BendPoint, CCSet, ControllerId, Event, Note, Pitch};
use crate::event_list::EventList;
use crate::patch_bay::PatchBay;
use crate::track::{Track, TrackId};
use crate::track_list::TrackList;
use crate::transport::Transport;
use crate::unit::{PortSet, PortTypeTag, Unit, UnitId, UnitKind};

pub const DOCUMENT_FORMAT_ID: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub format_id: u16,
    pub title: String,
}

impl DocumentMeta {
    pub fn new(title: impl Into<String>) -> DocumentMeta {
        DocumentMeta {
            format_id: DOCUMENT_FORMAT_ID,
            title: title.into(),
        }
    }

    pub fn to_toml(&self) -> CoreResult<String> {
        toml::to_string(self).map_err(|e| CoreError::DeserializationError(e.to_string()))
    }

    pub fn from_toml(data: &str) -> CoreResult<DocumentMeta> {
        toml::from_str(data).map_err(|e| CoreError::DeserializationError(e.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentNote {
    pub time: Seconds,
    pub duration: Seconds,
    pub pitch: Pitch,
    pub velocity: f32,
    pub bend: Vec<(Seconds, f32)>,
    pub aftertouch: Vec<(Seconds, f32)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentCCSet {
    pub time: Seconds,
    pub number: ControllerId,
    pub value: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum DocumentEvent {
    Note(DocumentNote),
    CC(DocumentCCSet),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentEventList {
    pub events: Vec<DocumentEvent>,
    pub duration: Seconds,
    pub divisions: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentBlock {
    pub id: BlockId,
    pub time: Seconds,
    pub events: DocumentEventList,
    pub duration: Seconds,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentTrack {
    pub name: String,
    pub blocks: Vec<DocumentBlock>,
    pub solo: bool,
    pub mute: bool,
    pub arm: bool,
    pub bend_range: f32,
    pub pitch_names: HashMap<Pitch, String>,
    pub controller_names: HashMap<ControllerId, String>,
    pub controller_outputs: HashMap<ControllerId, f32>,
    /// Every track shares the document's single `Transport`; nothing
    /// track-specific is stored here. Kept as an explicit field so the
    /// persisted shape matches the data model's field list.
    pub transport_ref: (),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum DocumentPortSet {
    Single(u64),
    Pair(u64, u64),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum DocumentUnitKind {
    Sequencer { track_list_id: u64 },
    DeviceList { input: bool },
    SystemPlayback,
    Sampler { instrument_names: Vec<String> },
    Transport,
    Monitor,
    Group,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentUnit {
    pub id: UnitId,
    pub name: String,
    pub kind: DocumentUnitKind,
    pub position: (f32, f32),
    pub size: (f32, f32),
    pub color_hue: Option<f32>,
    pub source_ports: Option<(DocumentPortSet, PortTypeTag)>,
    pub sink_ports: Option<(DocumentPortSet, PortTypeTag)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentConnection {
    pub source: UnitId,
    pub sink: UnitId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentTransport {
    pub duration: Seconds,
    pub marks: Vec<Seconds>,
    pub cycling: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Document {
    /// Sampler/system-playback/device-list units.
    pub devices: Vec<DocumentUnit>,
    pub transport: DocumentTransport,
    pub view_scale: f32,
    /// Sequencer/monitor/group units (everything not a device).
    pub units: Vec<DocumentUnit>,
    pub tracks: HashMap<TrackId, DocumentTrack>,
    pub patch_bay: Vec<DocumentConnection>,
}

impl Document {
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::DeserializationError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Document> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::DeserializationError(e.to_string()))
    }
}

fn note_to_document(note: &Note) -> DocumentNote {
    DocumentNote {
        time: note.start,
        duration: note.duration,
        pitch: note.pitch,
        velocity: note.velocity,
        bend: note.bend.iter().map(|b| (b.time_offset, b.semitones)).collect(),
        aftertouch: note.aftertouch.iter().map(|a| (a.time_offset, a.velocity)).collect(),
    }
}

fn note_from_document(doc: &DocumentNote) -> Note {
    let mut note = Note::new(doc.time, doc.duration, doc.pitch, doc.velocity);
    note.bend = doc
        .bend
        .iter()
        .map(|&(time_offset, semitones)| BendPoint { time_offset, semitones })
        .collect();
    note.aftertouch = doc
        .aftertouch
        .iter()
        .map(|&(time_offset, velocity)| AftertouchPoint { time_offset, velocity })
        .collect();
    note
}

fn event_list_to_document(events: &EventList) -> DocumentEventList {
    DocumentEventList {
        events: events
            .events()
            .iter()
            .map(|e| match &e.event {
                Event::Note(n) => DocumentEvent::Note(note_to_document(n)),
                Event::CC(cc) => DocumentEvent::CC(DocumentCCSet {
                    time: cc.time,
                    number: cc.controller,
                    value: cc.value,
                }),
            })
            .collect(),
        duration: events.duration,
        divisions: events.divisions,
    }
}

fn event_list_from_document(doc: &DocumentEventList) -> EventList {
    let mut events = EventList::new();
    events.duration = doc.duration;
    events.divisions = doc.divisions;
    for ev in &doc.events {
        match ev {
            DocumentEvent::Note(n) => {
                events.append_note(note_from_document(n));
            }
            DocumentEvent::CC(cc) => {
                events.append_cc(CCSet {
                    time: cc.time,
                    controller: cc.number,
                    value: cc.value,
                });
            }
        }
    }
    events
}



fn block_to_document(block: &Block) -> DocumentBlock {
    DocumentBlock {
        id: block.id,
        time: block.start,
        events: event_list_to_document(&block.events),
        duration: block.duration,
    }
}

fn block_from_document(doc: &DocumentBlock) -> Block {
    let mut block = Block::new(doc.id, doc.time, event_list_from_document(&doc.events));
    block.duration = doc.duration;
    block
}

fn track_to_document(track: &Track) -> DocumentTrack {
    DocumentTrack {
        name: track.name.clone(),
        blocks: track.blocks().iter().map(block_to_document).collect(),
        solo: track.solo,
        mute: track.mute,
        arm: track.arm,
        bend_range: track.bend_range,
        pitch_names: track.pitch_names.clone(),
        controller_names: track.controller_names.clone(),
        controller_outputs: track.controller_values.clone(),
        transport_ref: (),
    }
}

fn track_from_document(id: TrackId, doc: &DocumentTrack) -> Track {
    let mut track = Track::new(id, doc.name.clone());
    track.solo = doc.solo;
    track.mute = doc.mute;
    track.arm = doc.arm;
    track.bend_range = doc.bend_range;
    track.pitch_names = doc.pitch_names.clone();
    track.controller_names = doc.controller_names.clone();
    for (&controller, &value) in &doc.controller_outputs {
        track.set_controller_value(controller, value);
    }
    for b in &doc.blocks {
        track.push_block(block_from_document(b));
    }
    track
}

fn unit_kind_to_document(kind: &UnitKind) -> DocumentUnitKind {
    match kind {
        UnitKind::Sequencer { track_list_id } => DocumentUnitKind::Sequencer {
            track_list_id: *track_list_id,
        },
        UnitKind::DeviceList { input } => DocumentUnitKind::DeviceList { input: *input },
        UnitKind::SystemPlayback => DocumentUnitKind::SystemPlayback,
        UnitKind::Sampler { instrument_names } => DocumentUnitKind::Sampler {
            instrument_names: instrument_names.clone(),
        },
        UnitKind::Transport => DocumentUnitKind::Transport,
        UnitKind::Monitor => DocumentUnitKind::Monitor,
        UnitKind::Group => DocumentUnitKind::Group,
    }
}

fn unit_kind_from_document(doc: &DocumentUnitKind) -> UnitKind {
    match doc {
        DocumentUnitKind::Sequencer { track_list_id } => UnitKind::Sequencer {
            track_list_id: *track_list_id,
        },
        DocumentUnitKind::DeviceList { input } => UnitKind::DeviceList { input: *input },
        DocumentUnitKind::SystemPlayback => UnitKind::SystemPlayback,
        DocumentUnitKind::Sampler { instrument_names } => UnitKind::Sampler {
            instrument_names: instrument_names.clone(),
        },
        DocumentUnitKind::Transport => UnitKind::Transport,
        DocumentUnitKind::Monitor => UnitKind::Monitor,
        DocumentUnitKind::Group => UnitKind::Group,
    }
}

fn is_device_kind(kind: &UnitKind) -> bool {
    matches!(
        kind,
        UnitKind::Sampler { .. } | UnitKind::SystemPlayback | UnitKind::DeviceList { .. }
    )
}

fn port_set_to_document(ports: &(PortSet, PortTypeTag)) -> (DocumentPortSet, PortTypeTag) {
    let set = match ports.0 {
        PortSet::Single(p) => DocumentPortSet::Single(p),
        PortSet::Pair(a, b) => DocumentPortSet::Pair(a, b),
    };
    (set, ports.1)
}

fn port_set_from_document(doc: &(DocumentPortSet, PortTypeTag)) -> (PortSet, PortTypeTag) {
    let set = match doc.0 {
        DocumentPortSet::Single(p) => PortSet::Single(p),
        DocumentPortSet::Pair(a, b) => PortSet::Pair(a, b),
    };
    (set, doc.1)
}

fn unit_to_document(unit: &Unit) -> DocumentUnit {
    DocumentUnit {
        id: unit.id,
        name: unit.name.clone(),
        kind: unit_kind_to_document(&unit.kind),
        position: unit.position,
        size: unit.size,
        color_hue: unit.color_hue,
        source_ports: unit.source_ports().map(port_set_to_document),
        sink_ports: unit.sink_ports().map(port_set_to_document),
    }
}

fn unit_from_document(doc: &DocumentUnit) -> Unit {
    let kind = unit_kind_from_document(&doc.kind);
    let mut unit = Unit::new(doc.id, doc.name.clone(), kind);
    unit.position = doc.position;
    unit.size = doc.size;
    unit.color_hue = doc.color_hue;
    if let Some(ports) = &doc.source_ports {
        let (set, tag) = port_set_from_document(ports);
        unit.set_source(set, tag);
    }
    if let Some(ports) = &doc.sink_ports {
        let (set, tag) = port_set_from_document(ports);
        unit.set_sink(set, tag);
    }
    unit
}

/// Assemble a [`Document`] from the live runtime components. `units` is the
/// full unit arena contents (both device and non-device units; this
/// function sorts them into `devices`/`units`).
pub fn build_document(
    tracks: &TrackList,
    transport: &Transport,
    patch_bay: &PatchBay,
    units: impl IntoIterator<Item = (UnitId, Unit)>,
    view_scale: f32,
) -> Document {
    let mut devices = Vec::new();
    let mut plain_units = Vec::new();
    for (_, unit) in units {
        let doc_unit = unit_to_document(&unit);
        if is_device_kind(&unit.kind) {
            devices.push(doc_unit);
        } else {
            plain_units.push(doc_unit);
        }
    }

    let doc_tracks = tracks
        .tracks()
        .iter()
        .map(|t| {
            let t = t.borrow();
            (t.id, track_to_document(&t))
        })
        .collect();

    let mut connections = Vec::new();
    for unit in plain_units.iter().chain(devices.iter()) {
        for sink in patch_bay.sinks_for_source(unit.id) {
            connections.push(DocumentConnection { source: unit.id, sink });
        }
    }

    Document {
        devices,
        transport: DocumentTransport {
            duration: transport.duration(),
            marks: transport.marks().to_vec(),
            cycling: transport.cycling(),
        },
        view_scale,
        units: plain_units,
        tracks: doc_tracks,
        patch_bay: connections,
    }
}

/// Reconstruct the `Unit`s described by a document's `devices`/`units`
/// lists. Connecting them back into a `PatchBay` is left to the caller,
/// which needs a live `PortClient` to reconcile routing.
pub fn units_from_document(doc: &Document) -> Vec<Unit> {
    doc.devices
        .iter()
        .chain(doc.units.iter())
        .map(unit_from_document)
        .collect()
}

/// Rebuild a `TrackList` (sharing `transport`) from a [`Document`]'s track
/// entries. Units and patch-bay connections are left to the caller, since
/// reconstructing them requires a live `PortClient` to reconcile routing.
///
/// `TrackList` owns its own id sequence, so a reloaded track is not
/// guaranteed to keep the `TrackId` it had when saved; `doc.tracks`' keys
/// only fix the load order (ascending), not the resulting ids.
pub fn tracks_from_document(doc: &Document, transport: Rc<RefCell<Transport>>) -> TrackList {
    let mut list = TrackList::new(transport);
    let mut ids: Vec<&TrackId> = doc.tracks.keys().collect();
    ids.sort();
    for id in ids {
        let doc_track = &doc.tracks[id];
        let new_id = list.add_track(doc_track.name.clone());
        if let Some(track_ref) = list.track(new_id) {
            *track_ref.borrow_mut() = track_from_document(new_id, doc_track);
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Note;

    #[test]
    fn event_list_roundtrips_through_document_form() {
        let mut events = EventList::new();
        events.duration = 2.0;
        events.divisions = 4;
        events.insert_note(Note::new(0.0, 0.5, 60, 0.8));
        events.insert_cc(CCSet { time: 0.2, controller: 7, value: 0.5 });

        let doc = event_list_to_document(&events);
        let restored = event_list_from_document(&doc);

        assert_eq!(events.len(), restored.len());
        assert_eq!(2.0, restored.duration);
        assert_eq!(4, restored.divisions);
    }

    #[test]
    fn document_meta_roundtrips_through_toml() {
        let meta = DocumentMeta::new("My Song");
        let text = meta.to_toml().unwrap();
        let restored = DocumentMeta::from_toml(&text).unwrap();
        assert_eq!(meta.format_id, restored.format_id);
        assert_eq!(meta.title, restored.title);
    }

    #[test]
    fn document_roundtrips_through_rmp_bytes() {
        let doc = Document {
            devices: Vec::new(),
            transport: DocumentTransport {
                duration: 10.0,
                marks: vec![1.0, 2.0],
                cycling: true,
            },
            view_scale: 1.0,
            units: Vec::new(),
            tracks: HashMap::new(),
            patch_bay: Vec::new(),
        };
        let bytes = doc.to_bytes().unwrap();
        let restored = Document::from_bytes(&bytes).unwrap();
        assert_eq!(doc.transport.duration, restored.transport.duration);
        assert_eq!(doc.transport.marks, restored.transport.marks);
    }

    #[test]
    fn track_roundtrips_blocks_and_flags() {
        let mut track = Track::new(1, "bass");
        track.mute = true;
        track.bend_range = 12.0;
        let mut events = EventList::new();
        events.duration = 1.0;
        events.insert_note(Note::new(0.0, 0.2, 40, 0.7));
        track.push_block(Block::new(1, 0.0, events));

        let doc = track_to_document(&track);
        let restored = track_from_document(1, &doc);

        assert_eq!(track.name, restored.name);
        assert!(restored.mute);
        assert_eq!(12.0, restored.bend_range);
        assert_eq!(1, restored.blocks().len());
    }

    #[test]
    fn unit_kind_payload_survives_document_roundtrip() {
        let mut unit = Unit::new(5, "bass sampler", UnitKind::Sampler {
            instrument_names: vec!["piano.sfz".to_string()],
        });
        unit.set_source(PortSet::Pair(1, 2), PortTypeTag::Stereo);

        let doc = Document {
            devices: vec![unit_to_document(&unit)],
            transport: DocumentTransport { duration: 0.0, marks: Vec::new(), cycling: false },
            view_scale: 1.0,
            units: Vec::new(),
            tracks: HashMap::new(),
            patch_bay: Vec::new(),
        };

        let restored = units_from_document(&doc);
        assert_eq!(1, restored.len());
        assert_eq!(
            UnitKind::Sampler { instrument_names: vec!["piano.sfz".to_string()] },
            restored[0].kind
        );
        assert_eq!(Some(&(PortSet::Pair(1, 2), PortTypeTag::Stereo)), restored[0].source_ports());
    }
}
