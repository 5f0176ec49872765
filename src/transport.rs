//! Rolling clock bridged to the external server's transport, marks, and
//! cycle region. No direct teacher analogue (the source has no live
//! transport, only a static `TransportTime` type alias in `engine.rs`);
//! grounded on the data model's transport state machine and the source's periodic-tick idiom
//! in `engine.rs`'s `Engine::start` loop, adapted to an explicit pump
//! method the application task drives instead of an internal thread.

use crate::common::Seconds;
use crate::notify::Notifier;
use crate::port_client::SharedPortClient;

const DEFAULT_DISPLAY_INTERVAL: Seconds = 0.050;
const IDLE_PUMP_PERIOD: Seconds = 0.500;
const ROLLING_PUMP_PERIOD: Seconds = 0.050;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Recording,
}

pub struct Transport {
    port: SharedPortClient,
    state: TransportState,
    duration: Seconds,
    marks: Vec<Seconds>,
    cycling: bool,
    cycle_start_override: Option<Seconds>,
    cycle_end_override: Option<Seconds>,
    /// Active cycle window, cached from marks/overrides relative to the time
    /// the window was last (re)armed. Read by `drive_cycling` instead of
    /// re-deriving from the live, possibly already-overshot, `time()`.
    cycle_start_cache: Seconds,
    cycle_end_cache: Option<Seconds>,
    time_override: Option<Seconds>,
    rolling_override: Option<bool>,
    display_interval: Seconds,
    since_last_publish: Seconds,
    notifier: Notifier,
}

impl Transport {
    pub fn new(port: SharedPortClient) -> Transport {
        Transport::with_display_interval(port, DEFAULT_DISPLAY_INTERVAL)
    }

    pub fn with_display_interval(port: SharedPortClient, display_interval: Seconds) -> Transport {
        let mut t = Transport {
            port,
            state: TransportState::Stopped,
            duration: 0.0,
            marks: Vec::new(),
            cycling: false,
            cycle_start_override: None,
            cycle_end_override: None,
            cycle_start_cache: 0.0,
            cycle_end_cache: None,
            time_override: None,
            rolling_override: None,
            display_interval,
            since_last_publish: 0.0,
            notifier: Notifier::default(),
        };
        t.update_cycle_bounds();
        t
    }

    pub fn subscribe(&mut self, observer: impl FnMut() + Send + 'static) {
        self.notifier.subscribe(observer);
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_rolling(&self) -> bool {
        if let Some(v) = self.rolling_override {
            v
        } else {
            self.port.borrow().transport_state().0
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state == TransportState::Recording
    }

    pub fn time(&self) -> Seconds {
        if let Some(t) = self.time_override {
            t
        } else {
            self.port.borrow().transport_state().1
        }
    }

    /// Writes while Recording are silently ignored, per the transport's
    /// failure semantics.
    pub fn set_time(&mut self, t: Seconds) {
        if self.is_recording() {
            return;
        }
        self.time_override = Some(t);
        self.port.borrow_mut().transport_seek(t);
        self.update_cycle_bounds();
        self.notifier.notify();
    }

    pub fn duration(&self) -> Seconds {
        self.duration
    }

    pub fn set_duration(&mut self, d: Seconds) {
        self.duration = d;
        self.notifier.notify();
    }

    /// Entering Playing clears Recording and vice versa; stop clears both.
    pub fn set_playing(&mut self, v: bool) {
        if v {
            self.enter_recording_or_playing(TransportState::Playing);
        } else if self.state == TransportState::Playing {
            self.stop();
        }
    }

    pub fn set_recording(&mut self, v: bool) {
        if v {
            self.enter_recording_or_playing(TransportState::Recording);
        } else if self.state == TransportState::Recording {
            self.stop();
        }
    }

    fn enter_recording_or_playing(&mut self, next: TransportState) {
        if next == self.state {
            return;
        }
        self.update_cycle_bounds();
        if next == TransportState::Recording {
            self.notifier.notify(); // recording_will_start
        }
        self.state = next;
        self.rolling_override = Some(true);
        self.port.borrow_mut().transport_start();
        if next == TransportState::Recording {
            self.notifier.notify(); // recording_started
        } else {
            self.notifier.notify();
        }
    }

    fn stop(&mut self) {
        let was_recording = self.state == TransportState::Recording;
        if was_recording {
            self.notifier.notify(); // recording_will_stop
        }
        self.state = TransportState::Stopped;
        self.rolling_override = Some(false);
        self.port.borrow_mut().transport_stop();
        self.notifier.notify(); // recording_stopped / generic stop
    }

    pub fn toggle_mark(&mut self) {
        let t = self.time();
        if let Some(idx) = self.marks.iter().position(|m| (*m - t).abs() < f64::EPSILON) {
            self.marks.remove(idx);
        } else {
            let idx = self.marks.partition_point(|m| *m < t);
            self.marks.insert(idx, t);
        }
        self.notifier.notify();
    }

    pub fn marks(&self) -> &[Seconds] {
        &self.marks
    }

    /// Nearest mark strictly before `time()`; 0.0 if none.
    pub fn previous_mark(&self) -> Seconds {
        self.previous_mark_from(self.time())
    }

    /// Nearest mark strictly after `time()`, if any.
    pub fn next_mark(&self) -> Option<Seconds> {
        self.next_mark_from(self.time())
    }

    fn previous_mark_from(&self, t: Seconds) -> Seconds {
        self.marks
            .iter()
            .rev()
            .find(|m| **m < t)
            .copied()
            .unwrap_or(0.0)
    }

    fn next_mark_from(&self, t: Seconds) -> Option<Seconds> {
        self.marks.iter().find(|m| **m > t).copied()
    }

    pub fn set_cycling(&mut self, v: bool) {
        self.update_cycle_bounds();
        self.cycling = v;
        self.notifier.notify();
    }

    pub fn cycling(&self) -> bool {
        self.cycling
    }

    pub fn set_cycle_start(&mut self, t: Option<Seconds>) {
        self.cycle_start_override = t;
        self.update_cycle_bounds();
    }

    pub fn set_cycle_end(&mut self, t: Option<Seconds>) {
        self.cycle_end_override = t;
        self.update_cycle_bounds();
    }

    /// Re-derive the active cycle window from the overrides/marks relative
    /// to the current time. Called whenever the time or the window inputs
    /// change so `drive_cycling` only ever reads an already-current window,
    /// never one derived from a time it has already overshot.
    fn update_cycle_bounds(&mut self) {
        let t = self.time();
        self.cycle_start_cache = self
            .cycle_start_override
            .unwrap_or_else(|| self.previous_mark_from(t + f64::EPSILON));
        self.cycle_end_cache = self.cycle_end_override.or_else(|| self.next_mark_from(t));
    }

    pub fn pump_period(&self) -> Seconds {
        if self.is_rolling() {
            ROLLING_PUMP_PERIOD
        } else {
            IDLE_PUMP_PERIOD
        }
    }

    /// One tick of the periodic update pump: read host state (clearing
    /// overrides), drive cycling, and publish a coalesced notification at
    /// most every `display_interval`.
    pub fn tick(&mut self, dt: Seconds) {
        self.time_override = None;
        self.rolling_override = None;
        let cycling_wrapped = self.drive_cycling();
        self.since_last_publish += dt;
        if cycling_wrapped || self.since_last_publish >= self.display_interval {
            self.since_last_publish = 0.0;
            self.notifier.notify();
        }
    }

    /// Implements the cycling wrap. `cycle_start == cycle_end` is a
    /// no-op (zero-length cycle region never wraps); an undefined
    /// `cycle_end` (no next mark, no override) is also a no-op. Bounds come
    /// from the cache armed by `update_cycle_bounds`, not a fresh mark
    /// search against `time()` — by the time this runs, `time()` may already
    /// sit past `cycle_end`, which would make a live search find no "next
    /// mark" at all.
    fn drive_cycling(&mut self) -> bool {
        if !self.cycling {
            return false;
        }
        let Some(end) = self.cycle_end_cache else {
            return false;
        };
        let start = self.cycle_start_cache;
        if (end - start).abs() < f64::EPSILON {
            return false;
        }
        let time = self.time();
        if time > end {
            let wrapped = start + (time - end);
            self.time_override = Some(wrapped);
            self.port.borrow_mut().transport_seek(wrapped);
            self.update_cycle_bounds();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_client::MockPortClient;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn transport_with_mock() -> (Transport, SharedPortClient) {
        let port: SharedPortClient = Rc::new(RefCell::new(MockPortClient::new()));
        (Transport::new(port.clone()), port)
    }

    #[test]
    fn playing_and_recording_are_mutually_exclusive() {
        let (mut t, _port) = transport_with_mock();
        t.set_playing(true);
        assert_eq!(TransportState::Playing, t.state());
        t.set_recording(true);
        assert_eq!(TransportState::Recording, t.state());
        t.set_playing(true);
        assert_eq!(TransportState::Playing, t.state());
    }

    #[test]
    fn stop_clears_both_states() {
        let (mut t, _port) = transport_with_mock();
        t.set_recording(true);
        t.set_recording(false);
        assert_eq!(TransportState::Stopped, t.state());
    }

    #[test]
    fn time_writes_while_recording_are_ignored() {
        let (mut t, _port) = transport_with_mock();
        t.set_recording(true);
        t.set_time(5.0);
        assert_ne!(5.0, t.time());
    }

    #[test]
    fn previous_mark_without_any_mark_is_zero() {
        let (t, _port) = transport_with_mock();
        assert_eq!(0.0, t.previous_mark());
    }

    #[test]
    fn toggle_mark_adds_and_removes() {
        let (mut t, port) = transport_with_mock();
        port.borrow_mut().transport_seek(2.0);
        t.toggle_mark();
        assert_eq!(&[2.0], t.marks());
        t.toggle_mark();
        assert!(t.marks().is_empty());
    }

    #[test]
    fn cycling_wraps_past_cycle_end_to_cycle_start() {
        let (mut t, port) = transport_with_mock();
        t.set_cycling(true);
        t.set_cycle_start(Some(1.0));
        t.set_cycle_end(Some(3.0));
        port.borrow_mut().transport_seek(3.5);
        t.tick(0.05);
        assert_eq!(1.5, t.time());
    }

    #[test]
    fn cycling_wraps_using_mark_derived_bounds() {
        let (mut t, port) = transport_with_mock();
        port.borrow_mut().transport_seek(1.0);
        t.toggle_mark();
        port.borrow_mut().transport_seek(3.0);
        t.toggle_mark();
        assert_eq!(&[1.0, 3.0], t.marks());
        port.borrow_mut().transport_seek(2.0);
        t.set_cycling(true);
        port.borrow_mut().transport_seek(3.05);
        t.tick(0.05);
        assert_eq!(1.05, t.time());
    }

    #[test]
    fn zero_length_cycle_region_is_a_no_op() {
        let (mut t, port) = transport_with_mock();
        t.set_cycling(true);
        t.set_cycle_start(Some(2.0));
        t.set_cycle_end(Some(2.0));
        port.borrow_mut().transport_seek(5.0);
        t.tick(0.05);
        assert_eq!(5.0, t.time());
    }

    #[test]
    fn undefined_cycle_end_is_a_no_op() {
        let (mut t, port) = transport_with_mock();
        t.set_cycling(true);
        t.set_cycle_start(Some(1.0));
        port.borrow_mut().transport_seek(100.0);
        t.tick(0.05);
        assert_eq!(100.0, t.time());
    }

    #[test]
    fn pump_period_depends_on_rolling_state() {
        let (mut t, port) = transport_with_mock();
        assert_eq!(IDLE_PUMP_PERIOD, t.pump_period());
        port.borrow_mut().transport_start();
        t.tick(0.0);
        assert_eq!(ROLLING_PUMP_PERIOD, t.pump_period());
    }
}
