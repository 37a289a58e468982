//! IO worker: owns the framed connection and polls it on a fixed tick.
//!
//! ```text
//!  app thread                      Shared                      IO thread
//!  ──────────                      ──────                      ─────────
//!  update_presence() ──post──▶  presence (Mailbox) ──take──▶  write SET_ACTIVITY
//!  respond()/handlers ─push──▶  send_queue (SPSC)  ──pop───▶  write command
//!  run_callbacks()   ◀─take───  ready/disconnected/errored/   ◀─post── read dispatch
//!                               join_game/spectate_game
//!  run_callbacks()   ◀─pop────  join_requests (SPSC) ◀─push── ACTIVITY_JOIN_REQUEST
//! ```
//!
//! Every tick: (re)connect if due, otherwise drain inbound frames, send the
//! latest presence, then the queued commands. The thread sleeps one tick
//! between passes unless [`Shared::signal`] wakes it early.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::backoff::Backoff;
use crate::config::RpcConfig;
use crate::connection::{Connection, ConnectionState, RpcConnection};
use crate::queue::{Mailbox, SpscQueue};
use crate::serialization::{
    get_code_member, get_obj_member, get_str_member, parse_user, write_subscribe,
    write_unsubscribe, QueuedMessage, User,
};

/// Outbound command queue depth.
pub const SEND_QUEUE_CAPACITY: usize = 8;
/// Pending join request queue depth.
pub const JOIN_QUEUE_CAPACITY: usize = 8;

/// Error code and message, either local (see
/// [`crate::connection::ErrorCode`]) or sent by the companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: i32,
    pub message: String,
}

/// Dispatch events the client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribedEvent {
    JoinGame,
    SpectateGame,
    JoinRequest,
}

impl SubscribedEvent {
    pub const ALL: [SubscribedEvent; 3] = [
        SubscribedEvent::JoinGame,
        SubscribedEvent::SpectateGame,
        SubscribedEvent::JoinRequest,
    ];

    /// Event name on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Self::JoinGame => "ACTIVITY_JOIN",
            Self::SpectateGame => "ACTIVITY_SPECTATE",
            Self::JoinRequest => "ACTIVITY_JOIN_REQUEST",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::JoinGame => 1,
            Self::SpectateGame => 1 << 1,
            Self::JoinRequest => 1 << 2,
        }
    }
}

/// Recorded subscriptions and whether the current connection has already
/// been sent them.
#[derive(Debug, Default)]
struct Subscriptions {
    bits: u8,
    replayed: bool,
}

/// Connection changes not yet seen by `run_callbacks`, taken together.
#[derive(Debug, Default)]
pub struct LinkEvents {
    pub disconnected: Option<ErrorReport>,
    pub ready: Option<User>,
    pub connected: bool,
}

/// State shared between the façade and the IO worker.
pub struct Shared {
    pub(crate) connected: AtomicBool,
    nonce: AtomicU64,
    subscriptions: Mutex<Subscriptions>,
    /// Held while the connected flag moves together with `ready` or
    /// `disconnected`
    link: Mutex<()>,
    running: AtomicBool,
    wake: Mutex<bool>,
    wake_cond: Condvar,

    /// Latest serialized presence, coalesced
    pub(crate) presence: Mailbox<QueuedMessage>,
    pub(crate) send_queue: SpscQueue<QueuedMessage, SEND_QUEUE_CAPACITY>,
    pub(crate) join_requests: SpscQueue<User, JOIN_QUEUE_CAPACITY>,

    pub(crate) ready: Mailbox<User>,
    pub(crate) disconnected: Mailbox<ErrorReport>,
    pub(crate) errored: Mailbox<ErrorReport>,
    pub(crate) join_game: Mailbox<String>,
    pub(crate) spectate_game: Mailbox<String>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            nonce: AtomicU64::new(1),
            subscriptions: Mutex::new(Subscriptions::default()),
            link: Mutex::new(()),
            running: AtomicBool::new(false),
            wake: Mutex::new(false),
            wake_cond: Condvar::new(),
            presence: Mailbox::new(),
            send_queue: SpscQueue::new(),
            join_requests: SpscQueue::new(),
            ready: Mailbox::new(),
            disconnected: Mailbox::new(),
            errored: Mailbox::new(),
            join_game: Mailbox::new(),
            spectate_game: Mailbox::new(),
        }
    }

    /// `true` once READY has been received on the current connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an outbound command; dropped with a warning when the queue is
    /// full.
    pub fn enqueue(&self, message: QueuedMessage) -> bool {
        match self.send_queue.try_push(message) {
            Ok(()) => {
                self.signal();
                true
            }
            Err(_) => {
                log::warn!("Presence send queue full, dropping command");
                false
            }
        }
    }

    /// Record a subscription. It is queued for sending only once the current
    /// connection has received the recorded set; until then the replay
    /// carries it.
    pub fn subscribe(&self, event: SubscribedEvent) {
        let mut subscriptions = self.subscriptions.lock();
        let added = subscriptions.bits & event.bit() == 0;
        subscriptions.bits |= event.bit();
        if added && subscriptions.replayed {
            match write_subscribe(self.next_nonce(), event.name()) {
                Ok(message) => {
                    self.enqueue(message);
                }
                Err(e) => log::error!("Failed to serialize subscribe: {e}"),
            }
        }
    }

    pub fn unsubscribe(&self, event: SubscribedEvent) {
        let mut subscriptions = self.subscriptions.lock();
        let removed = subscriptions.bits & event.bit() != 0;
        subscriptions.bits &= !event.bit();
        if removed && subscriptions.replayed {
            match write_unsubscribe(self.next_nonce(), event.name()) {
                Ok(message) => {
                    self.enqueue(message);
                }
                Err(e) => log::error!("Failed to serialize unsubscribe: {e}"),
            }
        }
    }

    pub fn subscribed(&self) -> Vec<SubscribedEvent> {
        events_in(self.subscriptions.lock().bits)
    }

    /// Snapshot the subscriptions to send on a fresh connection. Later
    /// changes are queued by `subscribe`/`unsubscribe` instead.
    pub(crate) fn begin_replay(&self) -> Vec<SubscribedEvent> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.replayed = true;
        events_in(subscriptions.bits)
    }

    fn mark_connected(&self, user: User) {
        let _link = self.link.lock();
        self.connected.store(true, Ordering::SeqCst);
        self.ready.post(user);
    }

    fn mark_disconnected(&self, report: ErrorReport) {
        let _link = self.link.lock();
        self.subscriptions.lock().replayed = false;
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected.post(report);
    }

    /// Take pending connect/disconnect signals along with the connected flag
    /// as of the same instant.
    pub fn take_link_events(&self) -> LinkEvents {
        let _link = self.link.lock();
        LinkEvents {
            disconnected: self.disconnected.take(),
            ready: self.ready.take(),
            connected: self.is_connected(),
        }
    }

    /// Wake the IO worker before its tick elapses.
    pub fn signal(&self) {
        *self.wake.lock() = true;
        self.wake_cond.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = self.wake.lock();
        if !*pending {
            self.wake_cond.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }

    /// Forget everything queued or signalled.
    pub fn reset(&self) {
        let _link = self.link.lock();
        self.connected.store(false, Ordering::SeqCst);
        *self.subscriptions.lock() = Subscriptions::default();
        self.presence.clear();
        self.send_queue.clear();
        self.join_requests.clear();
        self.ready.clear();
        self.disconnected.clear();
        self.errored.clear();
        self.join_game.clear();
        self.spectate_game.clear();
    }
}

fn events_in(bits: u8) -> Vec<SubscribedEvent> {
    SubscribedEvent::ALL
        .into_iter()
        .filter(|event| bits & event.bit() != 0)
        .collect()
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one [`RpcConnection`] on behalf of the façade.
pub struct IoWorker {
    connection: RpcConnection,
    shared: Arc<Shared>,
    backoff: Backoff,
    next_connect: Instant,
}

impl IoWorker {
    pub fn new(
        transport: Box<dyn Connection>,
        app_id: &str,
        shared: Arc<Shared>,
        config: &RpcConfig,
    ) -> Self {
        let mut connection = RpcConnection::new(transport, app_id, config.rpc_version);

        let on_connect = shared.clone();
        connection.set_on_connect(move |message: &Value| {
            let data = get_obj_member(Some(message), "data");
            let user = parse_user(get_obj_member(data, "user")).unwrap_or_default();
            on_connect.mark_connected(user);
        });

        let on_disconnect = shared.clone();
        connection.set_on_disconnect(move |code, message| {
            on_disconnect.mark_disconnected(ErrorReport {
                code,
                message: message.to_owned(),
            });
        });

        Self {
            connection,
            shared,
            backoff: Backoff::new(config.reconnect_min, config.reconnect_max),
            next_connect: Instant::now(),
        }
    }

    pub fn connection(&self) -> &RpcConnection {
        &self.connection
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// One pass of the IO loop.
    pub fn update_connection(&mut self) {
        match self.connection.state() {
            ConnectionState::Connected => {
                self.pump_reads();
                self.flush_presence();
                self.flush_queue();
                if !self.connection.is_open() {
                    self.schedule_reconnect();
                }
            }
            ConnectionState::SentHandshake | ConnectionState::AwaitingResponse => {
                self.connection.open();
                match self.connection.state() {
                    ConnectionState::Connected => {
                        self.backoff.reset();
                        self.resubscribe();
                    }
                    // Handshake abandoned; wait out the backoff
                    ConnectionState::Disconnected => self.schedule_reconnect(),
                    _ => {}
                }
            }
            ConnectionState::Disconnected => {
                if Instant::now() >= self.next_connect {
                    self.schedule_reconnect();
                    self.connection.open();
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.next_connect = Instant::now() + self.backoff.next_delay();
    }

    fn resubscribe(&mut self) {
        for event in self.shared.begin_replay() {
            let written = write_subscribe(self.shared.next_nonce(), event.name())
                .and_then(|message| self.connection.write(message.as_bytes()));
            if let Err(e) = written {
                log::debug!("Subscribe to {} failed: {e}", event.name());
                return;
            }
        }
    }

    fn pump_reads(&mut self) {
        while let Some(message) = self.connection.read() {
            self.handle_message(&message);
        }
    }

    fn handle_message(&self, message: &Value) {
        let evt = get_str_member(Some(message), "evt");
        let data = get_obj_member(Some(message), "data");

        if get_str_member(Some(message), "nonce").is_some() {
            // Reply to one of our commands; only errors are interesting
            if evt == Some("ERROR") {
                let report = ErrorReport {
                    code: get_code_member(data, "code"),
                    message: get_str_member(data, "message")
                        .unwrap_or_default()
                        .to_owned(),
                };
                log::warn!("Presence command failed ({}): {}", report.code, report.message);
                self.shared.errored.post(report);
            }
            return;
        }

        match evt {
            Some("ACTIVITY_JOIN") => {
                if let Some(secret) = get_str_member(data, "secret") {
                    self.shared.join_game.post(secret.to_owned());
                }
            }
            Some("ACTIVITY_SPECTATE") => {
                if let Some(secret) = get_str_member(data, "secret") {
                    self.shared.spectate_game.post(secret.to_owned());
                }
            }
            Some("ACTIVITY_JOIN_REQUEST") => match parse_user(get_obj_member(data, "user")) {
                Some(user) => {
                    if self.shared.join_requests.try_push(user).is_err() {
                        log::warn!("Join request queue full, dropping request");
                    }
                }
                None => log::debug!("Join request without a usable user"),
            },
            Some(other) => log::debug!("Ignoring dispatch {other}"),
            None => {}
        }
    }

    fn flush_presence(&mut self) {
        let Some(presence) = self.shared.presence.take() else {
            return;
        };
        if let Err(e) = self.connection.write(presence.as_bytes()) {
            log::debug!("Presence update deferred: {e}");
            // Retry next tick unless the app posted something newer
            self.shared.presence.post_if_empty(presence);
        }
    }

    /// Drain every queued command. A command that fails to write is
    /// dropped, never carried over to the next connection.
    fn flush_queue(&mut self) {
        while let Some(message) = self.shared.send_queue.pop() {
            if let Err(e) = self.connection.write(message.as_bytes()) {
                log::debug!("Dropped queued command: {e}");
            }
        }
    }

    /// Close the connection for good.
    pub fn shutdown(&mut self) {
        self.connection.close();
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

/// Background thread running an [`IoWorker`].
pub struct IoThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl IoThread {
    pub fn start(mut worker: IoWorker, tick: Duration) -> io::Result<Self> {
        let shared = worker.shared.clone();
        shared.running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("presence-io".into())
            .spawn(move || {
                log::debug!("Presence IO thread started");
                worker.update_connection();
                while worker.shared.running.load(Ordering::SeqCst) {
                    worker.shared.wait(tick);
                    if !worker.shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    worker.update_connection();
                }
                worker.shutdown();
                log::debug!("Presence IO thread stopped");
            });

        match handle {
            Ok(handle) => Ok(Self {
                shared,
                handle: Some(handle),
            }),
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Ask the thread to finish and wait for it.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Presence IO thread panicked");
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop();
    }
}
