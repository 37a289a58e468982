//! In-memory transport and scripted companion for tests and demos.
//!
//! [`FakeConnection`] is handed to the client as its [`Connection`];
//! the paired [`FakeCompanion`] plays the other end of the pipe: it queues
//! inbound frames, records every frame the client writes, and can refuse
//! connections, hang up, or fail writes on demand.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::connection::Connection;
use crate::protocol::{decode_frame, encode_frame, FrameHeader, Opcode};

#[derive(Debug)]
struct Pipe {
    /// Companion accepts new connections
    available: bool,
    /// Client end is open
    open: bool,
    /// Companion closed its end; buffered bytes stay readable
    hung_up: bool,
    fail_writes: bool,
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    opens: usize,
    /// READY sent back automatically after each handshake
    ready_user: Option<(String, String)>,
}

impl Pipe {
    fn push_frame(&mut self, frame: &[u8]) {
        self.inbound.extend(frame.iter().copied());
    }
}

/// Client side of the in-memory pipe.
#[derive(Debug)]
pub struct FakeConnection {
    pipe: Arc<Mutex<Pipe>>,
}

/// Companion side of the in-memory pipe. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FakeCompanion {
    pipe: Arc<Mutex<Pipe>>,
}

impl FakeConnection {
    /// A connected pair; the companion starts out accepting connections.
    pub fn pair() -> (FakeConnection, FakeCompanion) {
        let pipe = Arc::new(Mutex::new(Pipe {
            available: true,
            open: false,
            hung_up: false,
            fail_writes: false,
            inbound: VecDeque::new(),
            written: Vec::new(),
            opens: 0,
            ready_user: None,
        }));
        (
            FakeConnection { pipe: pipe.clone() },
            FakeCompanion { pipe },
        )
    }
}

impl Connection for FakeConnection {
    fn open(&mut self) -> io::Result<()> {
        let mut pipe = self.pipe.lock();
        if !pipe.available {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "companion not running",
            ));
        }
        pipe.open = true;
        pipe.hung_up = false;
        pipe.inbound.clear();
        pipe.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut pipe = self.pipe.lock();
        pipe.open = false;
        pipe.inbound.clear();
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut pipe = self.pipe.lock();
        if !pipe.open {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let wanted = buf.len();
        if pipe.inbound.len() >= wanted {
            for (slot, byte) in buf.iter_mut().zip(pipe.inbound.drain(..wanted)) {
                *slot = byte;
            }
            return Ok(());
        }
        if pipe.hung_up {
            pipe.open = false;
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if pipe.inbound.is_empty() {
            Err(io::ErrorKind::WouldBlock.into())
        } else {
            Err(io::ErrorKind::UnexpectedEof.into())
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut pipe = self.pipe.lock();
        if !pipe.open || pipe.hung_up {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if pipe.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        pipe.written.push(data.to_vec());

        let is_handshake = decode_frame(data)
            .map(|(header, _)| header.opcode() == Some(Opcode::Handshake))
            .unwrap_or(false);
        if is_handshake {
            if let Some((id, username)) = pipe.ready_user.clone() {
                let frame = ready_frame(&id, &username);
                pipe.push_frame(&frame);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.pipe.lock().open
    }
}

fn frame_bytes(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    // Test payloads are always far below the frame limit
    encode_frame(opcode, payload).unwrap_or_default()
}

fn ready_frame(id: &str, username: &str) -> Vec<u8> {
    let message = json!({
        "cmd": "DISPATCH",
        "evt": "READY",
        "data": {
            "v": 1,
            "user": { "id": id, "username": username, "discriminator": "0001", "avatar": "" }
        }
    });
    frame_bytes(Opcode::Frame, message.to_string().as_bytes())
}

impl FakeCompanion {
    /// Accept (or refuse) subsequent connection attempts.
    pub fn set_available(&self, available: bool) {
        self.pipe.lock().available = available;
    }

    /// Answer every handshake with a READY for this user.
    pub fn respond_to_handshake(&self, id: &str, username: &str) {
        self.pipe.lock().ready_user = Some((id.to_owned(), username.to_owned()));
    }

    /// Close the companion's end and refuse reconnects until
    /// [`Self::set_available`] is called again.
    pub fn hang_up(&self) {
        let mut pipe = self.pipe.lock();
        pipe.hung_up = true;
        pipe.available = false;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.pipe.lock().fail_writes = fail;
    }

    pub fn send_raw(&self, opcode: Opcode, payload: &[u8]) {
        self.pipe.lock().push_frame(&frame_bytes(opcode, payload));
    }

    /// An arbitrary header, which may carry an unknown opcode or a length
    /// that disagrees with `payload`.
    pub fn send_header(&self, header: FrameHeader, payload: &[u8]) {
        let mut pipe = self.pipe.lock();
        pipe.push_frame(&header.to_bytes());
        pipe.push_frame(payload);
    }

    pub fn send_frame(&self, message: Value) {
        self.send_raw(Opcode::Frame, message.to_string().as_bytes());
    }

    /// A header announcing `payload.len()` bytes followed by only the first
    /// `keep` of them.
    pub fn send_truncated(&self, opcode: Opcode, payload: &[u8], keep: usize) {
        let header = FrameHeader::new(opcode, payload.len() as u32);
        self.send_header(header, &payload[..keep.min(payload.len())]);
    }

    pub fn send_ready(&self, id: &str, username: &str) {
        self.pipe.lock().push_frame(&ready_frame(id, username));
    }

    pub fn send_dispatch(&self, evt: &str, data: Value) {
        self.send_frame(json!({ "cmd": "DISPATCH", "evt": evt, "data": data }));
    }

    /// An `ERROR` reply to the command carrying `nonce`.
    pub fn send_error(&self, nonce: &str, code: i64, message: &str) {
        self.send_frame(json!({
            "cmd": "SET_ACTIVITY",
            "evt": "ERROR",
            "nonce": nonce,
            "data": { "code": code, "message": message }
        }));
    }

    pub fn send_join_request(&self, id: &str, username: &str) {
        self.send_dispatch(
            "ACTIVITY_JOIN_REQUEST",
            json!({ "user": { "id": id, "username": username, "discriminator": "1337", "avatar": "abc" } }),
        );
    }

    pub fn send_close(&self, code: i64, message: &str) {
        let body = json!({ "code": code, "message": message }).to_string();
        self.send_raw(Opcode::Close, body.as_bytes());
    }

    /// Every frame the client wrote, decoded. Empty payloads decode to
    /// `Value::Null`.
    pub fn written_frames(&self) -> Vec<(Opcode, Value)> {
        self.pipe
            .lock()
            .written
            .iter()
            .filter_map(|bytes| {
                let (header, payload) = decode_frame(bytes).ok()?;
                let value = serde_json::from_slice(payload).unwrap_or(Value::Null);
                Some((header.opcode()?, value))
            })
            .collect()
    }

    /// Payloads of the `Frame` opcode only (commands), in write order.
    pub fn written_commands(&self) -> Vec<Value> {
        self.written_frames()
            .into_iter()
            .filter(|(opcode, _)| *opcode == Opcode::Frame)
            .map(|(_, value)| value)
            .collect()
    }

    pub fn clear_written(&self) {
        self.pipe.lock().written.clear();
    }

    pub fn is_client_open(&self) -> bool {
        self.pipe.lock().open
    }

    /// Number of successful transport opens so far.
    pub fn open_count(&self) -> usize {
        self.pipe.lock().opens
    }
}
