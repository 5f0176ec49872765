//! Workspace nodes the `PatchBay` connects. A `Unit` is position/size/name
//! plus a kind-specific payload and an optional set of source/sink ports.
//! No direct teacher analogue (the source has no patch-bay concept at all);
//! grounded on the data model's Unit/PortSet vocabulary and shaped after
//! `app.rs`'s plain-struct-with-flags style for workspace entities.

use serde::{Deserialize, Serialize};

use crate::port_client::PortHandle;

pub type UnitId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortTypeTag {
    Mono,
    Stereo,
    Midi,
}

/// A unit's ports of one direction: either a single handle or a stereo
/// pair. `PatchBay` routing logic treats a pair as index-wise pairable and
/// fans the shorter side out when paired with a mono/single port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSet {
    Single(PortHandle),
    Pair(PortHandle, PortHandle),
}

impl PortSet {
    pub fn handles(&self) -> Vec<PortHandle> {
        match self {
            PortSet::Single(a) => vec![*a],
            PortSet::Pair(a, b) => vec![*a, *b],
        }
    }

    pub fn is_stereo(&self) -> bool {
        matches!(self, PortSet::Pair(_, _))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitKind {
    Sequencer { track_list_id: u64 },
    DeviceList { input: bool },
    SystemPlayback,
    Sampler { instrument_names: Vec<String> },
    Transport,
    Monitor,
    Group,
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub id: UnitId,
    pub name: String,
    pub kind: UnitKind,
    pub position: (f32, f32),
    pub size: (f32, f32),
    pub color_hue: Option<f32>,
    source_ports: Option<(PortSet, PortTypeTag)>,
    sink_ports: Option<(PortSet, PortTypeTag)>,
}

impl Unit {
    pub fn new(id: UnitId, name: impl Into<String>, kind: UnitKind) -> Unit {
        Unit {
            id,
            name: name.into(),
            kind,
            position: (0.0, 0.0),
            size: (120.0, 80.0),
            color_hue: None,
            source_ports: None,
            sink_ports: None,
        }
    }

    pub fn set_source(&mut self, ports: PortSet, tag: PortTypeTag) {
        self.source_ports = Some((ports, tag));
    }

    pub fn set_sink(&mut self, ports: PortSet, tag: PortTypeTag) {
        self.sink_ports = Some((ports, tag));
    }

    pub fn clear_source(&mut self) {
        self.source_ports = None;
    }

    pub fn clear_sink(&mut self) {
        self.sink_ports = None;
    }

    pub fn is_source(&self) -> bool {
        self.source_ports.is_some()
    }

    pub fn is_sink(&self) -> bool {
        self.sink_ports.is_some()
    }

    pub fn source_ports(&self) -> Option<&(PortSet, PortTypeTag)> {
        self.source_ports.as_ref()
    }

    pub fn sink_ports(&self) -> Option<&(PortSet, PortTypeTag)> {
        self.sink_ports.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_unit_is_neither_source_nor_sink() {
        let u = Unit::new(1, "sampler", UnitKind::Sampler { instrument_names: vec![] });
        assert!(!u.is_source());
        assert!(!u.is_sink());
    }

    #[test]
    fn pair_reports_two_handles() {
        let pair = PortSet::Pair(1, 2);
        assert_eq!(vec![1, 2], pair.handles());
        assert!(pair.is_stereo());
    }
}
