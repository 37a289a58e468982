//! Application-facing presence client.
//!
//! Provides:
//! - Lifecycle (initialize, shutdown) of the IO worker thread
//! - Coalesced presence updates
//! - Join request replies
//! - Event handler registration, mirrored as SUBSCRIBE/UNSUBSCRIBE commands
//! - `run_callbacks`, the only place user handlers are invoked
//!
//! Every method is synchronous and cheap; network IO happens on the worker.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RpcConfig;
use crate::connection::{Connection, RpcError};
use crate::serialization::{write_join_reply, write_rich_presence, Reply, RichPresence, User};
use crate::worker::{IoThread, IoWorker, Shared, SubscribedEvent};

type UserHandler = Box<dyn FnMut(&User) + Send>;
type ErrorHandler = Box<dyn FnMut(i32, &str) + Send>;
type SecretHandler = Box<dyn FnMut(&str) + Send>;

/// User callbacks. Any of them may be left unset; setting `join_game`,
/// `spectate_game` or `join_request` subscribes to the matching event.
#[derive(Default)]
pub struct EventHandlers {
    pub ready: Option<UserHandler>,
    pub disconnected: Option<ErrorHandler>,
    pub errored: Option<ErrorHandler>,
    pub join_game: Option<SecretHandler>,
    pub spectate_game: Option<SecretHandler>,
    pub join_request: Option<UserHandler>,
}

impl EventHandlers {
    pub fn on_ready(mut self, handler: impl FnMut(&User) + Send + 'static) -> Self {
        self.ready = Some(Box::new(handler));
        self
    }

    pub fn on_disconnected(mut self, handler: impl FnMut(i32, &str) + Send + 'static) -> Self {
        self.disconnected = Some(Box::new(handler));
        self
    }

    pub fn on_errored(mut self, handler: impl FnMut(i32, &str) + Send + 'static) -> Self {
        self.errored = Some(Box::new(handler));
        self
    }

    pub fn on_join_game(mut self, handler: impl FnMut(&str) + Send + 'static) -> Self {
        self.join_game = Some(Box::new(handler));
        self
    }

    pub fn on_spectate_game(mut self, handler: impl FnMut(&str) + Send + 'static) -> Self {
        self.spectate_game = Some(Box::new(handler));
        self
    }

    pub fn on_join_request(mut self, handler: impl FnMut(&User) + Send + 'static) -> Self {
        self.join_request = Some(Box::new(handler));
        self
    }

    fn handles(&self, event: SubscribedEvent) -> bool {
        match event {
            SubscribedEvent::JoinGame => self.join_game.is_some(),
            SubscribedEvent::SpectateGame => self.spectate_game.is_some(),
            SubscribedEvent::JoinRequest => self.join_request.is_some(),
        }
    }
}

/// Rich presence client for one application id.
///
/// Create once, [`initialize`](Self::initialize) with a transport, then call
/// [`run_callbacks`](Self::run_callbacks) from the application thread on a
/// steady cadence (e.g. once per frame).
pub struct DiscordRpc {
    config: RpcConfig,
    shared: Arc<Shared>,
    /// Held across registration and every handler invocation
    handlers: Mutex<EventHandlers>,
    io_thread: Option<IoThread>,
    pid: u32,
}

impl DiscordRpc {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            handlers: Mutex::new(EventHandlers::default()),
            io_thread: None,
            pid: std::process::id(),
        }
    }

    /// Start talking to the companion over `transport`. Returns immediately;
    /// the connection is established in the background. No-op if already
    /// initialized.
    pub fn initialize(
        &mut self,
        app_id: &str,
        handlers: EventHandlers,
        transport: impl Connection + 'static,
    ) -> Result<(), RpcError> {
        if self.io_thread.is_some() {
            log::debug!("Presence client already initialized");
            return Ok(());
        }
        log::info!("Initializing presence client for app {app_id}");

        *self.handlers.lock() = EventHandlers::default();
        self.update_handlers(handlers);

        let worker = IoWorker::new(Box::new(transport), app_id, self.shared.clone(), &self.config);
        self.io_thread = Some(IoThread::start(worker, self.config.tick_interval)?);
        Ok(())
    }

    /// Stop the worker and drop all handlers and pending traffic. Safe to
    /// call when never initialized.
    pub fn shutdown(&mut self) {
        *self.handlers.lock() = EventHandlers::default();
        self.shared.presence.clear();
        if let Some(mut io_thread) = self.io_thread.take() {
            io_thread.stop();
            log::info!("Presence client shut down");
        }
        self.shared.reset();
    }

    pub fn is_initialized(&self) -> bool {
        self.io_thread.is_some()
    }

    /// `true` while the handshake is complete on the current connection.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Replace the displayed presence. Only the latest update between two
    /// worker ticks is sent.
    pub fn update_presence(&self, presence: &RichPresence<'_>) -> Result<(), RpcError> {
        self.post_presence(Some(presence))
    }

    /// Remove the displayed presence.
    pub fn clear_presence(&self) -> Result<(), RpcError> {
        self.post_presence(None)
    }

    fn post_presence(&self, presence: Option<&RichPresence<'_>>) -> Result<(), RpcError> {
        let message = write_rich_presence(self.shared.next_nonce(), self.pid, presence)?;
        if self.shared.presence.post(message).is_some() {
            log::debug!("Coalesced pending presence update");
        }
        self.shared.signal();
        Ok(())
    }

    /// Answer a join request. Ignored while disconnected: the request it
    /// answers belongs to a connection that no longer exists.
    pub fn respond(&self, user_id: &str, reply: Reply) -> Result<(), RpcError> {
        if !self.is_initialized() || !self.is_connected() {
            return Ok(());
        }
        let message = write_join_reply(user_id, reply, self.shared.next_nonce())?;
        self.shared.enqueue(message);
        Ok(())
    }

    /// Swap the handler set, subscribing to events whose handler appears and
    /// unsubscribing from those whose handler goes away.
    ///
    /// Must not be called from inside a handler.
    pub fn update_handlers(&self, new_handlers: EventHandlers) {
        let mut handlers = self.handlers.lock();
        for event in SubscribedEvent::ALL {
            match (handlers.handles(event), new_handlers.handles(event)) {
                (false, true) => self.shared.subscribe(event),
                (true, false) => self.shared.unsubscribe(event),
                _ => {}
            }
        }
        *handlers = new_handlers;
    }

    /// Deliver everything that happened since the last call, on the calling
    /// thread.
    ///
    /// Order: a stale disconnect (already reconnected), ready, errored,
    /// join game, spectate game, every pending join request, then a current
    /// disconnect. Each signal fires at most once per call.
    pub fn run_callbacks(&self) {
        if !self.is_initialized() {
            return;
        }

        let link = self.shared.take_link_events();
        let mut handlers = self.handlers.lock();

        if link.connected {
            if let (Some(report), Some(handler)) = (&link.disconnected, handlers.disconnected.as_mut()) {
                handler(report.code, &report.message);
            }
        }

        if let Some(user) = &link.ready {
            if let Some(handler) = handlers.ready.as_mut() {
                handler(user);
            }
        }

        if let Some(report) = self.shared.errored.take() {
            if let Some(handler) = handlers.errored.as_mut() {
                handler(report.code, &report.message);
            }
        }

        if let Some(secret) = self.shared.join_game.take() {
            if let Some(handler) = handlers.join_game.as_mut() {
                handler(&secret);
            }
        }

        if let Some(secret) = self.shared.spectate_game.take() {
            if let Some(handler) = handlers.spectate_game.as_mut() {
                handler(&secret);
            }
        }

        while let Some(user) = self.shared.join_requests.pop() {
            if let Some(handler) = handlers.join_request.as_mut() {
                handler(&user);
            }
        }

        if !link.connected {
            if let (Some(report), Some(handler)) = (&link.disconnected, handlers.disconnected.as_mut()) {
                handler(report.code, &report.message);
            }
        }
    }
}

impl Default for DiscordRpc {
    fn default() -> Self {
        Self::new(RpcConfig::default())
    }
}

impl Drop for DiscordRpc {
    fn drop(&mut self) {
        self.shutdown();
    }
}
