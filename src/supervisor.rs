//! Manages the external sampler subprocess: spawn, stdout/stderr readiness
//! scan, and a line-based request/response protocol with a FIFO command
//! queue. No teacher analogue (the source has no subprocess); grounded on
//! the crate's cooperative-pump idiom (`transport.rs`, `patch_bay.rs`) and
//! its failure-propagation style (`error.rs`), adapted with a background
//! reader thread since a child's stdout cannot be polled without blocking.
//!
//! `escape_lscp_string`/`load_instrument_command` are grounded on the
//! original `_escape`/`_load_path` helpers that quote an instrument path
//! before sending it to the sampler over this same line protocol.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::{CoreError, CoreResult};

const READY_MARKER: &str = "Starting network server";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, PartialEq)]
pub enum SamplerResponse {
    /// `OK` or `OK[<id>]`; the id, if the server assigned one.
    Ok(Option<String>),
    Warning(String),
    Error(String),
    Block(HashMap<String, String>),
    List(Vec<String>),
}

impl SamplerResponse {
    /// `OK` and `WRN` both count as success for connection-creation
    /// commands.
    pub fn is_success(&self) -> bool {
        matches!(self, SamplerResponse::Ok(_) | SamplerResponse::Warning(_))
    }
}

/// One line of response accumulation in progress.
enum Accumulator {
    Idle,
    MultiLine(Vec<String>),
}

pub struct Supervisor {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    ready: bool,
    queue: VecDeque<String>,
    in_flight: Option<String>,
    accumulator: Accumulator,
    completed: VecDeque<(String, SamplerResponse)>,
}

impl Supervisor {
    /// Spawn the sampler process and start the background line reader.
    /// `program`/`args` describe the command line; readiness is not
    /// confirmed until [`Supervisor::pump`] observes the ready marker.
    pub fn spawn(program: &str, args: &[&str]) -> CoreResult<Supervisor> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::SamplerSpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::SamplerSpawnFailed("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::SamplerSpawnFailed("child has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::SamplerSpawnFailed("child has no stderr".into()))?;

        let (tx, rx) = mpsc::channel();
        let out_tx = tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                if out_tx.send(line).is_err() {
                    break;
                }
            }
        });
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Supervisor {
            child,
            stdin: Some(stdin),
            lines: rx,
            ready: false,
            queue: VecDeque::new(),
            in_flight: None,
            accumulator: Accumulator::Idle,
            completed: VecDeque::new(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Queue a command. Sent immediately if nothing is currently in flight.
    pub fn enqueue(&mut self, command: impl Into<String>) {
        self.queue.push_back(command.into());
        self.try_dispatch();
    }

    /// Pop the oldest completed (command, response) pair, in submission
    /// order.
    pub fn take_response(&mut self) -> Option<(String, SamplerResponse)> {
        self.completed.pop_front()
    }

    /// Drain whatever lines have arrived from the child without blocking.
    pub fn pump(&mut self) {
        loop {
            match self.lines.try_recv() {
                Ok(line) => self.on_line(line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn on_line(&mut self, line: String) {
        if !self.ready {
            if line.contains(READY_MARKER) && line.contains("OK") {
                self.ready = true;
                info!("sampler reported ready: {line}");
            }
            return;
        }
        if line.starts_with("WRN:") {
            warn!("sampler warning: {line}");
        }
        if line.starts_with("ERR:") {
            warn!("sampler error: {line}");
        }
        match &mut self.accumulator {
            Accumulator::Idle => {
                if line == "." {
                    return;
                }
                if is_terminal_line(&line) {
                    self.complete(classify_terminal(&line));
                } else {
                    self.accumulator = Accumulator::MultiLine(vec![line]);
                }
            }
            Accumulator::MultiLine(buf) => {
                if line == "." {
                    let buf = std::mem::take(buf);
                    self.accumulator = Accumulator::Idle;
                    self.complete(parse_kv_block(&buf));
                } else {
                    buf.push(line);
                }
            }
        }
    }

    fn complete(&mut self, response: SamplerResponse) {
        if let Some(cmd) = self.in_flight.take() {
            self.completed.push_back((cmd, response));
        }
        self.try_dispatch();
    }

    fn try_dispatch(&mut self) {
        if self.in_flight.is_some() || !self.ready {
            return;
        }
        let Some(cmd) = self.queue.pop_front() else {
            return;
        };
        let line = format!("{cmd}\r\n");
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        if let Err(err) = stdin.write_all(line.as_bytes()) {
            warn!("failed to write sampler command {cmd}: {err}");
            self.completed
                .push_back((cmd, SamplerResponse::Error(err.to_string())));
            return;
        }
        self.in_flight = Some(cmd);
    }

    /// Close the stdin socket, terminate the process, and wait up to ~2s
    /// with increasing kill attempts.
    pub fn shutdown(&mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        let mut attempt = 0;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(err) => {
                    warn!("error waiting for sampler shutdown: {err}");
                    return;
                }
            }
            attempt += 1;
            if attempt > 1 {
                let _ = self.child.kill();
            }
            thread::sleep(Duration::from_millis(50 * attempt.min(10)));
        }
        warn!("sampler process did not exit within {SHUTDOWN_TIMEOUT:?}");
    }
}

fn is_terminal_line(line: &str) -> bool {
    line == "OK" || line.starts_with("OK[") || line.starts_with("WRN:") || line.starts_with("ERR:")
}

fn classify_terminal(line: &str) -> SamplerResponse {
    if line == "OK" {
        SamplerResponse::Ok(None)
    } else if let Some(rest) = line.strip_prefix("OK[") {
        SamplerResponse::Ok(rest.strip_suffix(']').map(|s| s.to_string()))
    } else if let Some(rest) = line.strip_prefix("WRN:") {
        SamplerResponse::Warning(rest.trim().to_string())
    } else if let Some(rest) = line.strip_prefix("ERR:") {
        SamplerResponse::Error(rest.trim().to_string())
    } else {
        SamplerResponse::Error(format!("unrecognized response: {line}"))
    }
}

/// Parse a multi-line KEY: VALUE block (terminated by the caller having
/// already stripped the `.` line). A comma-separated value is split into a
/// [`SamplerResponse::List`] when there is exactly one key.
fn parse_kv_block(lines: &[String]) -> SamplerResponse {
    let mut map = HashMap::new();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    if map.len() == 1 {
        if let Some(value) = map.values().next() {
            if value.contains(',') {
                return SamplerResponse::List(split_quoted_list(value));
            }
        }
    }
    SamplerResponse::Block(map)
}

fn split_quoted_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_matches('\'').trim_matches('"').to_string())
        .collect()
}

/// Escape a string for inclusion as a quoted literal in an LSCP command:
/// backslash-escape the characters LSCP string literals reserve, and
/// `%`-hex-encode anything outside the ASCII range. A sampler path or name
/// supplied by a caller is untrusted input to the wire protocol and must be
/// escaped before it is embedded in a command line.
fn escape_lscp_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{000C}' => out.push_str("\\f"),
            '\t' => out.push_str("\\t"),
            '\u{000B}' => out.push_str("\\v"),
            c if (c as u32) > 127 => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Build a `LOAD INSTRUMENT` command for the given engine-relative channel,
/// escaping `path` per [`escape_lscp_string`].
pub fn load_instrument_command(path: &str, channel: u32) -> String {
    format!("LOAD INSTRUMENT '{}' 0 {channel}", escape_lscp_string(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_ok_with_id() {
        assert_eq!(
            SamplerResponse::Ok(Some("3".to_string())),
            classify_terminal("OK[3]")
        );
    }

    #[test]
    fn classify_bare_ok() {
        assert_eq!(SamplerResponse::Ok(None), classify_terminal("OK"));
    }

    #[test]
    fn warning_counts_as_success() {
        let resp = classify_terminal("WRN: channel already exists");
        assert!(resp.is_success());
    }

    #[test]
    fn error_does_not_count_as_success() {
        let resp = classify_terminal("ERR: no such device");
        assert!(!resp.is_success());
    }

    #[test]
    fn kv_block_parses_multiple_keys() {
        let lines = vec![
            "DESCRIPTION: Example sampler".to_string(),
            "VERSION: 1.0".to_string(),
        ];
        match parse_kv_block(&lines) {
            SamplerResponse::Block(map) => {
                assert_eq!(Some(&"1.0".to_string()), map.get("VERSION"));
            }
            other => panic!("expected a block, got {other:?}"),
        }
    }

    #[test]
    fn single_key_comma_value_parses_as_list() {
        let lines = vec!["AVAILABLE_ENGINES: 'GIG', 'SF2', 'SFZ'".to_string()];
        match parse_kv_block(&lines) {
            SamplerResponse::List(items) => {
                assert_eq!(vec!["GIG", "SF2", "SFZ"], items);
            }
            other => panic!("expected a list, got {other:?}"),
        }
    }

    #[test]
    fn escape_lscp_string_backslash_escapes_reserved_characters() {
        assert_eq!("a\\'b\\\"c\\\\d", escape_lscp_string("a'b\"c\\d"));
        assert_eq!("line\\nbreak", escape_lscp_string("line\nbreak"));
    }

    #[test]
    fn escape_lscp_string_hex_encodes_non_ascii() {
        assert_eq!("caf%E9", escape_lscp_string("caf\u{e9}"));
    }

    #[test]
    fn load_instrument_command_escapes_the_path() {
        let cmd = load_instrument_command("/samples/grand's.gig", 2);
        assert_eq!("LOAD INSTRUMENT '/samples/grand\\'s.gig' 0 2", cmd);
    }
}
