//! Headless integration stub: wires a `TrackList`, a `Transport`, and a
//! `MockPortClient` together, records a short phrase, rolls the transport
//! back to the top, and plays it back, printing what the mock port released.
//! Not an application shell: no config discovery beyond the built-in
//! default and no device scan, matching this crate's scope.

use std::cell::RefCell;
use std::rc::Rc;

use log::info;
use midly::MidiMessage;

use seqcore::config::Config;
use seqcore::playback_path::PlaybackPath;
use seqcore::port_client::{MockPortClient, PortClient, PortDirection, SharedPortClient};
use seqcore::recording_path::RecordingPath;
use seqcore::track_list::TrackList;
use seqcore::transport::Transport;
use seqcore::unit::PortTypeTag;

fn main() {
    stderrlog::new()
        .module(module_path!())
        .verbosity(log::Level::Info)
        .init()
        .unwrap();

    let config = Config::default();
    info!("loaded config: display_interval={}", config.display_interval);

    let mock = Rc::new(RefCell::new(MockPortClient::new()));
    let port: SharedPortClient = mock.clone();
    let sink = port
        .borrow_mut()
        .open_port("lead-in", PortDirection::Input, PortTypeTag::Midi)
        .unwrap();
    let source = port
        .borrow_mut()
        .open_port("lead-out", PortDirection::Output, PortTypeTag::Midi)
        .unwrap();

    let transport = Rc::new(RefCell::new(Transport::new(port.clone())));
    let mut tracks = TrackList::new(transport.clone());
    let lead = tracks.add_track("lead");
    tracks.track(lead).unwrap().borrow_mut().arm = true;

    let mut recorder = RecordingPath::new(tracks.track(lead).unwrap(), port.clone(), transport.clone(), sink);

    mock.borrow_mut().set_transport(true, 0.0);
    transport.borrow_mut().set_recording(true);
    for (pitch, at) in [(60u8, 0.0), (64, 0.5), (67, 1.0)] {
        mock.borrow_mut().push_incoming(sink, 0, MidiMessage::NoteOn { key: pitch.into(), vel: 100.into() }, at);
        mock.borrow_mut().set_transport(true, at);
        recorder.pump();
        mock.borrow_mut().push_incoming(sink, 0, MidiMessage::NoteOff { key: pitch.into(), vel: 0.into() }, at + 0.25);
        mock.borrow_mut().set_transport(true, at + 0.25);
        recorder.pump();
    }
    mock.borrow_mut().set_transport(true, 1.5);
    transport.borrow_mut().set_recording(false);
    recorder.pump();

    info!("recorded {} block(s)", tracks.track(lead).unwrap().borrow().blocks().len());

    transport.borrow_mut().set_time(0.0);
    mock.borrow_mut().set_transport(false, 0.0);
    let mut player = PlaybackPath::new(tracks.track(lead).unwrap(), port.clone(), transport.clone(), source);
    transport.borrow_mut().set_playing(true);
    mock.borrow_mut().set_transport(true, 0.0);

    for step in 0..40 {
        let now = step as f64 * 0.05;
        mock.borrow_mut().set_transport(true, now);
        player.pump();
        for (_, channel, message) in mock.borrow_mut().advance(0.0) {
            println!("t={now:.2} ch={channel} {message:?}");
        }
    }

    transport.borrow_mut().set_playing(false);
    player.pump();
    println!("done");
}
