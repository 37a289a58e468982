//! Message-oriented connection on top of a raw byte transport.
//!
//! ```text
//!   Disconnected ──open ok + handshake written──▶ SentHandshake
//!        ▲                                             │
//!        │                               READY dispatch│
//!        │                                             ▼
//!        └──────── read/write failure, Close ────── Connected
//! ```
//!
//! `on_disconnect` fires exactly once per transition back to `Disconnected`
//! from `SentHandshake`/`Connected`, before the transport is torn down.

use std::io;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{
    encode_frame, FrameError, FrameHeader, Opcode, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use crate::serialization::{get_code_member, get_str_member, write_handshake};

/// Raw byte transport to the companion process (named pipe, unix socket…).
///
/// `read` and `write` are exact: anything short of the full buffer is an
/// error. A `read` with nothing buffered returns
/// [`io::ErrorKind::WouldBlock`] and leaves the transport open.
pub trait Connection: Send {
    fn open(&mut self) -> io::Result<()>;
    fn close(&mut self);
    fn read(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn is_open(&self) -> bool;
}

/// Local failure codes reported through `on_disconnect`. Codes sent by the
/// companion in a `Close` frame are passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    PipeClosed = 1,
    ReadCorrupt = 2,
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("Message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    SentHandshake,
    /// Reserved by the protocol, never entered
    AwaitingResponse,
    Connected,
}

type ConnectHandler = Box<dyn FnMut(&Value) + Send>;
type DisconnectHandler = Box<dyn FnMut(i32, &str) + Send>;

/// Framed JSON channel with the handshake state machine.
pub struct RpcConnection {
    transport: Box<dyn Connection>,
    app_id: String,
    rpc_version: u32,
    state: ConnectionState,
    last_error_code: i32,
    last_error_message: String,
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<DisconnectHandler>,
}

impl RpcConnection {
    pub fn new(transport: Box<dyn Connection>, app_id: impl Into<String>, rpc_version: u32) -> Self {
        Self {
            transport,
            app_id: app_id.into(),
            rpc_version,
            state: ConnectionState::Disconnected,
            last_error_code: ErrorCode::Success as i32,
            last_error_message: String::new(),
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Called with the full READY dispatch once the handshake completes.
    pub fn set_on_connect(&mut self, handler: impl FnMut(&Value) + Send + 'static) {
        self.on_connect = Some(Box::new(handler));
    }

    /// Called with the last error code/message when the link drops.
    pub fn set_on_disconnect(&mut self, handler: impl FnMut(i32, &str) + Send + 'static) {
        self.on_disconnect = Some(Box::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `true` only once READY has been received.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn last_error(&self) -> (i32, &str) {
        (self.last_error_code, &self.last_error_message)
    }

    /// Advance the handshake by one step.
    ///
    /// From `Disconnected` this opens the transport and sends the handshake;
    /// from `SentHandshake` it polls for the READY dispatch.
    pub fn open(&mut self) {
        match self.state {
            ConnectionState::Connected | ConnectionState::AwaitingResponse => {}
            ConnectionState::SentHandshake => {
                let Some(message) = self.read() else {
                    return;
                };
                let cmd = get_str_member(Some(&message), "cmd");
                let evt = get_str_member(Some(&message), "evt");
                if cmd == Some("DISPATCH") && evt == Some("READY") {
                    log::info!("Presence handshake complete");
                    self.state = ConnectionState::Connected;
                    self.set_error(ErrorCode::Success as i32, "");
                    if let Some(on_connect) = self.on_connect.as_mut() {
                        on_connect(&message);
                    }
                } else {
                    log::debug!("Ignoring {cmd:?}/{evt:?} while awaiting READY");
                }
            }
            ConnectionState::Disconnected => {
                if let Err(e) = self.transport.open() {
                    log::debug!("Presence transport open failed: {e}");
                    return;
                }
                let sent = write_handshake(self.rpc_version, &self.app_id)
                    .ok()
                    .and_then(|hello| encode_frame(Opcode::Handshake, hello.as_bytes()).ok())
                    .map(|frame| self.transport.write(&frame));
                match sent {
                    Some(Ok(())) => {
                        log::debug!("Sent handshake for app {}", self.app_id);
                        self.state = ConnectionState::SentHandshake;
                    }
                    _ => {
                        log::warn!("Failed to send presence handshake");
                        self.close();
                    }
                }
            }
        }
    }

    /// Tear the connection down, notifying `on_disconnect` first if the
    /// handshake had started.
    pub fn close(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::SentHandshake
        ) {
            log::info!(
                "Presence connection closed ({}: {})",
                self.last_error_code,
                self.last_error_message
            );
            if let Some(on_disconnect) = self.on_disconnect.as_mut() {
                on_disconnect(self.last_error_code, &self.last_error_message);
            }
        }
        self.transport.close();
        self.state = ConnectionState::Disconnected;
    }

    /// Send one JSON payload in a `Frame`. Any transport failure closes the
    /// connection. Nothing is transmitted before the handshake has been sent.
    pub fn write(&mut self, payload: &[u8]) -> Result<(), RpcError> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::SentHandshake
        ) {
            return Err(RpcError::NotConnected);
        }
        let frame = encode_frame(Opcode::Frame, payload)?;
        if let Err(e) = self.transport.write(&frame) {
            log::debug!("Presence write failed: {e}");
            self.close();
            return Err(RpcError::Transport(e));
        }
        Ok(())
    }

    /// Read the next JSON `Frame`, answering pings along the way.
    ///
    /// `None` means either nothing is buffered right now or the connection
    /// was closed; [`Self::state`] tells the two apart.
    pub fn read(&mut self) -> Option<Value> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::SentHandshake
        ) {
            return None;
        }

        loop {
            let mut header_bytes = [0u8; HEADER_SIZE];
            if self.transport.read(&mut header_bytes).is_err() {
                if !self.transport.is_open() {
                    self.set_error(ErrorCode::PipeClosed as i32, "Pipe closed");
                    self.close();
                }
                return None;
            }
            let header = FrameHeader::from_bytes(&header_bytes);
            let length = header.length as usize;
            if length > MAX_PAYLOAD_SIZE {
                log::warn!("Presence frame of {length} bytes exceeds limit");
                self.fail_corrupt("Bad ipc frame");
                return None;
            }

            let mut payload = vec![0u8; length];
            if length > 0 && self.transport.read(&mut payload).is_err() {
                self.fail_corrupt("Partial data in frame");
                return None;
            }

            match header.opcode() {
                Some(Opcode::Close) => {
                    let message: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
                    let code = get_code_member(Some(&message), "code");
                    let text = get_str_member(Some(&message), "message").unwrap_or_default();
                    self.set_error(code, text);
                    self.close();
                    return None;
                }
                Some(Opcode::Frame) => match serde_json::from_slice(&payload) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        log::warn!("Unparseable presence frame: {e}");
                        self.fail_corrupt("Bad ipc frame");
                        return None;
                    }
                },
                Some(Opcode::Ping) => {
                    let pong = encode_frame(Opcode::Pong, &payload)
                        .map_err(RpcError::from)
                        .and_then(|frame| self.transport.write(&frame).map_err(RpcError::from));
                    if pong.is_err() {
                        self.close();
                        return None;
                    }
                }
                Some(Opcode::Pong) => {}
                Some(Opcode::Handshake) | None => {
                    log::warn!("Unexpected presence opcode {}", header.opcode);
                    self.fail_corrupt("Bad ipc frame");
                    return None;
                }
            }
        }
    }

    fn set_error(&mut self, code: i32, message: &str) {
        self.last_error_code = code;
        self.last_error_message.clear();
        self.last_error_message.push_str(message);
    }

    fn fail_corrupt(&mut self, message: &str) {
        self.set_error(ErrorCode::ReadCorrupt as i32, message);
        self.close();
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeCompanion, FakeConnection};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn connection() -> (RpcConnection, FakeCompanion) {
        let (transport, companion) = FakeConnection::pair();
        (RpcConnection::new(Box::new(transport), "app-1", 1), companion)
    }

    fn record_disconnects(conn: &mut RpcConnection) -> Arc<Mutex<Vec<(i32, String)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        conn.set_on_disconnect(move |code, message| sink.lock().push((code, message.to_owned())));
        log
    }

    fn connected() -> (RpcConnection, FakeCompanion) {
        let (mut conn, companion) = connection();
        conn.open();
        companion.send_ready("1", "gordon");
        conn.open();
        assert_eq!(conn.state(), ConnectionState::Connected);
        (conn, companion)
    }

    #[test]
    fn test_open_sends_handshake() {
        let (mut conn, companion) = connection();
        conn.open();

        assert_eq!(conn.state(), ConnectionState::SentHandshake);
        let frames = companion.written_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, Opcode::Handshake);
        assert_eq!(frames[0].1, json!({ "v": 1, "client_id": "app-1" }));
    }

    #[test]
    fn test_open_failure_stays_disconnected() {
        let (mut conn, companion) = connection();
        companion.set_available(false);
        conn.open();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(companion.written_frames().is_empty());
    }

    #[test]
    fn test_ready_completes_handshake() {
        let (mut conn, companion) = connection();
        let ready = Arc::new(Mutex::new(None));
        let sink = ready.clone();
        conn.set_on_connect(move |message| *sink.lock() = Some(message.clone()));

        conn.open();
        // Nothing buffered yet
        conn.open();
        assert_eq!(conn.state(), ConnectionState::SentHandshake);

        companion.send_ready("42", "alyx");
        conn.open();
        assert!(conn.is_open());
        let message = ready.lock().clone().unwrap();
        assert_eq!(message["data"]["user"]["username"], "alyx");
    }

    #[test]
    fn test_write_before_handshake_is_refused() {
        let (mut conn, companion) = connection();
        assert!(matches!(conn.write(b"{}"), Err(RpcError::NotConnected)));
        assert!(companion.written_frames().is_empty());
        assert!(conn.read().is_none());
    }

    #[test]
    fn test_write_wraps_frame() {
        let (mut conn, companion) = connected();
        conn.write(br#"{"cmd":"X"}"#).unwrap();

        let frames = companion.written_frames();
        let (opcode, body) = frames.last().unwrap();
        assert_eq!(*opcode, Opcode::Frame);
        assert_eq!(body, &json!({ "cmd": "X" }));
    }

    #[test]
    fn test_write_failure_closes() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);
        companion.fail_writes(true);

        assert!(conn.write(b"{}").is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.lock().len(), 1);
    }

    #[test]
    fn test_pipe_closed_fires_disconnect_once() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        companion.hang_up();
        assert!(conn.read().is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // Closing again must not report a second disconnect
        conn.close();
        let log = disconnects.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (ErrorCode::PipeClosed as i32, "Pipe closed".to_owned()));
    }

    #[test]
    fn test_no_data_keeps_connection() {
        let (mut conn, _companion) = connected();
        assert!(conn.read().is_none());
        assert!(conn.is_open());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut conn, companion) = connected();
        companion.send_raw(Opcode::Ping, b"{\"t\":1}");
        companion.send_frame(json!({ "cmd": "DISPATCH", "evt": "ACTIVITY_JOIN" }));

        let message = conn.read().unwrap();
        assert_eq!(message["evt"], "ACTIVITY_JOIN");

        let frames = companion.written_frames();
        let (opcode, body) = frames.last().unwrap();
        assert_eq!(*opcode, Opcode::Pong);
        assert_eq!(body, &json!({ "t": 1 }));
    }

    #[test]
    fn test_pong_ignored() {
        let (mut conn, companion) = connected();
        companion.send_raw(Opcode::Pong, b"");
        assert!(conn.read().is_none());
        assert!(conn.is_open());
    }

    #[test]
    fn test_close_frame_reports_remote_error() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        companion.send_close(4000, "Invalid client ID");
        assert!(conn.read().is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.lock()[0], (4000, "Invalid client ID".to_owned()));
    }

    #[test]
    fn test_unexpected_handshake_is_corrupt() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        companion.send_raw(Opcode::Handshake, b"{}");
        assert!(conn.read().is_none());
        assert_eq!(disconnects.lock()[0].0, ErrorCode::ReadCorrupt as i32);
    }

    #[test]
    fn test_truncated_payload_is_corrupt() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        companion.send_truncated(Opcode::Frame, b"{\"cmd\":\"DISPATCH\"}", 4);
        assert!(conn.read().is_none());
        assert_eq!(
            disconnects.lock()[0],
            (ErrorCode::ReadCorrupt as i32, "Partial data in frame".to_owned())
        );
    }

    fn assert_single_bad_frame(conn: &RpcConnection, disconnects: &Mutex<Vec<(i32, String)>>) {
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            *disconnects.lock(),
            [(ErrorCode::ReadCorrupt as i32, "Bad ipc frame".to_owned())]
        );
    }

    #[test]
    fn test_oversized_frame_is_corrupt() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        let header = FrameHeader::new(Opcode::Frame, (MAX_PAYLOAD_SIZE + 1) as u32);
        companion.send_header(header, b"{}");
        assert!(conn.read().is_none());
        assert_single_bad_frame(&conn, &disconnects);
    }

    #[test]
    fn test_unparseable_frame_is_corrupt() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        companion.send_raw(Opcode::Frame, b"{\"cmd\": DISPATCH");
        assert!(conn.read().is_none());
        assert_single_bad_frame(&conn, &disconnects);
    }

    #[test]
    fn test_unknown_opcode_is_corrupt() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        companion.send_header(FrameHeader { opcode: 7, length: 2 }, b"{}");
        assert!(conn.read().is_none());
        assert_single_bad_frame(&conn, &disconnects);
    }

    #[test]
    fn test_close_code_saturates() {
        let (mut conn, companion) = connected();
        let disconnects = record_disconnects(&mut conn);

        companion.send_close(9_000_000_000, "overflow");
        assert!(conn.read().is_none());
        assert_eq!(disconnects.lock()[0], (i32::MAX, "overflow".to_owned()));
    }

    #[test]
    fn test_oversized_write_is_frame_error() {
        let (mut conn, companion) = connected();
        companion.clear_written();

        let payload = vec![b' '; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            conn.write(&payload),
            Err(RpcError::Frame(FrameError::PayloadTooLarge { .. }))
        ));
        // Rejected before reaching the transport
        assert!(conn.is_open());
        assert!(companion.written_frames().is_empty());
    }

    #[test]
    fn test_reconnect_after_close() {
        let (mut conn, companion) = connected();
        companion.hang_up();
        assert!(conn.read().is_none());

        companion.set_available(true);
        conn.open();
        assert_eq!(conn.state(), ConnectionState::SentHandshake);
        companion.send_ready("1", "gordon");
        conn.open();
        assert!(conn.is_open());
        assert_eq!(conn.last_error(), (0, ""));
    }
}
