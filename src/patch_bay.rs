//! Graph of [`Connection`]s between [`Unit`] ports, mirrored onto the
//! external server via `PortClient`. No teacher analogue exists (the
//! source has no patch-bay concept); grounded on the data model's connection-
//! lifecycle contract and shaped after the source's `Arena`-less but
//! similarly event-driven `changeset.rs` observer style, adapted to the
//! handle-addressed `Arena` from [`crate::arena`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::{Arena, Handle};
use crate::notify::Notifier;
use crate::port_client::SharedPortClient;
use crate::unit::{PortSet, PortTypeTag, Unit, UnitId};

pub type ConnectionId = Handle;

/// The pairing rule when routing a `PortSet` to another: a tuple-to-tuple
/// route pairs index-wise; tuple-to-mono/mono-to-tuple fans the shorter
/// side out by repeating it.
fn pair_ports(source: &PortSet, sink: &PortSet) -> Vec<(u64, u64)> {
    match (source, sink) {
        (PortSet::Pair(sa, sb), PortSet::Pair(ka, kb)) => vec![(*sa, *ka), (*sb, *kb)],
        (PortSet::Pair(sa, sb), PortSet::Single(k)) => vec![(*sa, *k), (*sb, *k)],
        (PortSet::Single(s), PortSet::Pair(ka, kb)) => vec![(*s, *ka), (*s, *kb)],
        (PortSet::Single(s), PortSet::Single(k)) => vec![(*s, *k)],
    }
}

/// A connection's effective type is `mono` if either endpoint is mono,
/// otherwise the shared type (`midi` stays `midi`).
fn effective_type(a: PortTypeTag, b: PortTypeTag) -> PortTypeTag {
    if a == PortTypeTag::Mono || b == PortTypeTag::Mono {
        PortTypeTag::Mono
    } else {
        a
    }
}

#[derive(Debug)]
pub struct Connection {
    pub source: UnitId,
    pub sink: UnitId,
    /// Currently physically routed port pairs; updated by `reconcile`.
    realized: Vec<(u64, u64)>,
}

impl Connection {
    fn new(source: UnitId, sink: UnitId) -> Connection {
        Connection {
            source,
            sink,
            realized: Vec::new(),
        }
    }

    /// Apply the endpoint-change protocol: tear down any previously
    /// routed pair, establish the new one, and remember what is routed now.
    fn reconcile(&mut self, port: &SharedPortClient, units: &Arena<Unit>) {
        let wanted = self.wanted_pairs(units);
        let mut client = port.borrow_mut();
        for old in &self.realized {
            if !wanted.contains(old) {
                let _ = client.disconnect(old.0, old.1);
            }
        }
        for new in &wanted {
            if !self.realized.contains(new) {
                let _ = client.connect(new.0, new.1);
            }
        }
        self.realized = wanted;
    }

    fn teardown(&self, port: &SharedPortClient) {
        let mut client = port.borrow_mut();
        for (s, k) in &self.realized {
            let _ = client.disconnect(*s, *k);
        }
    }

    fn wanted_pairs(&self, units: &Arena<Unit>) -> Vec<(u64, u64)> {
        let Some(source_unit) = units.get(self.source) else {
            return Vec::new();
        };
        let Some(sink_unit) = units.get(self.sink) else {
            return Vec::new();
        };
        let (Some((sp, _)), Some((kp, _))) = (source_unit.source_ports(), sink_unit.sink_ports())
        else {
            return Vec::new();
        };
        pair_ports(sp, kp)
    }
}

pub struct PatchBay {
    connections: Arena<Connection>,
    units: Arena<Unit>,
    port: SharedPortClient,
    notifier: Notifier,
    /// (unit, fire_at) entries scheduled by a drop/reassign; see
    /// `schedule_deferred_notification` and `pump`.
    deferred: Vec<(UnitId, f64)>,
    defer_delay: f64,
}

impl PatchBay {
    pub fn new(port: SharedPortClient) -> PatchBay {
        PatchBay::with_defer_delay(port, 0.010)
    }

    pub fn with_defer_delay(port: SharedPortClient, defer_delay: f64) -> PatchBay {
        PatchBay {
            connections: Arena::new(),
            units: Arena::new(),
            port,
            notifier: Notifier::default(),
            deferred: Vec::new(),
            defer_delay,
        }
    }

    /// Schedule a change notification for `unit` to fire on a later `pump`
    /// call, roughly `defer_delay` seconds from `now`. Used when a
    /// Connection is dropped or reassigned so disconnect requests reach
    /// the server before the UI re-queries port state.
    fn schedule_deferred_notification(&mut self, unit: UnitId, now: f64) {
        self.deferred.push((unit, now + self.defer_delay));
    }

    /// Fire any deferred notifications whose time has arrived. Returns the
    /// units notified, so a caller can re-query their port state.
    pub fn pump(&mut self, now: f64) -> Vec<UnitId> {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.deferred.drain(..).partition(|(_, at)| *at <= now);
        self.deferred = pending;
        if !due.is_empty() {
            self.notifier.notify();
        }
        due.into_iter().map(|(u, _)| u).collect()
    }

    pub fn subscribe(&mut self, observer: impl FnMut() + Send + 'static) {
        self.notifier.subscribe(observer);
    }

    pub fn add_unit(&mut self, unit: Unit) -> Handle {
        self.units.insert(unit)
    }

    pub fn unit(&self, handle: Handle) -> Option<&Unit> {
        self.units.get(handle)
    }

    pub fn unit_mut(&mut self, handle: Handle) -> Option<&mut Unit> {
        self.units.get_mut(handle)
    }

    pub fn connect(&mut self, source: UnitId, sink: UnitId) -> ConnectionId {
        if let Some(existing) = self.find(source, sink) {
            return existing;
        }
        let mut conn = Connection::new(source, sink);
        conn.reconcile(&self.port, &self.units);
        let id = self.connections.insert(conn);
        self.notifier.notify();
        id
    }

    pub fn disconnect(&mut self, source: UnitId, sink: UnitId, now: f64) {
        let Some(id) = self.find(source, sink) else {
            return;
        };
        if let Some(conn) = self.connections.remove(id) {
            conn.teardown(&self.port);
            self.schedule_deferred_notification(conn.source, now);
            self.schedule_deferred_notification(conn.sink, now);
        }
        self.notifier.notify();
    }

    fn find(&self, source: UnitId, sink: UnitId) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|(_, c)| c.source == source && c.sink == sink)
            .map(|(id, _)| *id)
    }

    pub fn sources_for_sink(&self, sink: UnitId) -> Vec<UnitId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.sink == sink)
            .map(|(_, c)| c.source)
            .collect()
    }

    pub fn sinks_for_source(&self, source: UnitId) -> Vec<UnitId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.source == source)
            .map(|(_, c)| c.sink)
            .collect()
    }

    /// Cascade-remove every connection touching `unit`.
    pub fn remove_connections_for_unit(&mut self, unit: UnitId, now: f64) {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.source == unit || c.sink == unit)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(conn) = self.connections.remove(id) {
                conn.teardown(&self.port);
                self.schedule_deferred_notification(conn.source, now);
                self.schedule_deferred_notification(conn.sink, now);
            }
        }
        self.notifier.notify();
    }

    /// Re-derive every connection's realized routing from its endpoints'
    /// current ports. Call after a unit's ports materialize or change.
    pub fn reconcile_unit_ports(&mut self, unit: UnitId) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.source == unit || c.sink == unit)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.reconcile(&self.port, &self.units);
            }
        }
        self.notifier.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_client::MockPortClient;
    use crate::unit::UnitKind;

    fn bay() -> PatchBay {
        let port: SharedPortClient = Rc::new(RefCell::new(MockPortClient::new()));
        PatchBay::new(port)
    }

    #[test]
    fn connect_is_idempotent() {
        let mut bay = bay();
        let a = bay.add_unit(Unit::new(1, "a", UnitKind::Monitor));
        let b = bay.add_unit(Unit::new(2, "b", UnitKind::Monitor));
        let c1 = bay.connect(a, b);
        let c2 = bay.connect(a, b);
        assert_eq!(c1, c2);
        assert_eq!(1, bay.sinks_for_source(a).len());
    }

    #[test]
    fn cascade_remove_drops_all_edges_touching_unit() {
        let mut bay = bay();
        let a = bay.add_unit(Unit::new(1, "a", UnitKind::Monitor));
        let b = bay.add_unit(Unit::new(2, "b", UnitKind::Monitor));
        let c = bay.add_unit(Unit::new(3, "c", UnitKind::Monitor));
        bay.connect(a, b);
        bay.connect(a, c);
        bay.remove_connections_for_unit(a, 0.0);
        assert!(bay.sinks_for_source(a).is_empty());
        assert!(bay.sources_for_sink(b).is_empty());
        assert!(bay.sources_for_sink(c).is_empty());
    }

    #[test]
    fn disconnect_defers_endpoint_notification() {
        let mut bay = bay();
        let a = bay.add_unit(Unit::new(1, "a", UnitKind::Monitor));
        let b = bay.add_unit(Unit::new(2, "b", UnitKind::Monitor));
        bay.connect(a, b);
        bay.disconnect(a, b, 0.0);
        assert!(bay.pump(0.005).is_empty());
        let notified = bay.pump(0.010);
        assert_eq!(2, notified.len());
    }

    #[test]
    fn effective_type_is_mono_if_either_endpoint_is_mono() {
        assert_eq!(PortTypeTag::Mono, effective_type(PortTypeTag::Mono, PortTypeTag::Stereo));
        assert_eq!(PortTypeTag::Mono, effective_type(PortTypeTag::Stereo, PortTypeTag::Mono));
        assert_eq!(PortTypeTag::Midi, effective_type(PortTypeTag::Midi, PortTypeTag::Midi));
    }

    #[test]
    fn pair_ports_fans_out_mono_against_stereo() {
        let pairs = pair_ports(&PortSet::Pair(1, 2), &PortSet::Single(9));
        assert_eq!(vec![(1, 9), (2, 9)], pairs);
    }
}
