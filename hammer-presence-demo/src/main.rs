//! Hammer presence demo: a scripted editor session publishing rich
//! presence.
//!
//! Runs the real client and IO thread against the in-process fake
//! companion, so it needs no chat app installed. The companion plays a
//! friend asking to join the mapping lobby halfway through and hangs up
//! once near the end to show the reconnect path.
//!
//! `RUST_LOG=hammer_presence=debug` shows the frame traffic.

mod presence;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hammer_presence::fake::FakeConnection;
use hammer_presence::{DiscordRpc, EventHandlers, Reply, RpcConfig, User};
use log::{info, warn};
use parking_lot::Mutex;
use presence::{EditorPresence, Lobby};

const APP_ID: &str = "345229890980937739";
const FRAME_TIME: Duration = Duration::from_millis(16);
const FRAMES: u64 = 240;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn main() {
    env_logger::init();

    info!("Starting Hammer presence demo...");

    let (transport, companion) = FakeConnection::pair();
    companion.respond_to_handshake("53908232506183680", "mapper");

    // Join requests seen by the handler, answered from the frame loop
    let pending_requests: Arc<Mutex<Vec<User>>> = Arc::default();
    let requests = pending_requests.clone();
    let handlers = EventHandlers::default()
        .on_ready(|user| info!("Connected as {}#{}", user.username, user.discriminator))
        .on_disconnected(|code, message| warn!("Disconnected ({code}): {message}"))
        .on_errored(|code, message| warn!("Presence error ({code}): {message}"))
        .on_join_game(|secret| info!("Joining lobby with secret {secret}"))
        .on_join_request(move |user| {
            info!("{} wants to join", user.username);
            requests.lock().push(user.clone());
        });

    let config = RpcConfig {
        tick_interval: Duration::from_millis(50),
        ..RpcConfig::default()
    };
    let mut rpc = DiscordRpc::new(config);
    if let Err(e) = rpc.initialize(APP_ID, handlers, transport) {
        log::error!("Failed to start presence client: {e}");
        return;
    }

    let mut editor = EditorPresence::new();
    editor.open_map("cp_badlands.vmf", now_unix());

    for frame in 0..FRAMES {
        match frame {
            30 => editor.set_tool("Block"),
            45 => editor.set_selection(4),
            60 => editor.host_lobby(Lobby {
                id: "badlands-remake".into(),
                members: 1,
                capacity: 4,
                join_secret: "bXBfYmFkbGFuZHM=".into(),
            }),
            90 => companion.send_join_request("80351110224678912", "friend"),
            150 => companion.hang_up(),
            160 => companion.set_available(true),
            200 => editor.close_map(),
            _ => {}
        }

        if let Err(e) = editor.publish(&rpc) {
            warn!("Presence update rejected: {e}");
        }
        rpc.run_callbacks();

        for user in pending_requests.lock().drain(..) {
            let reply = if editor.add_member() { Reply::Yes } else { Reply::No };
            info!("Answering {} with {reply:?}", user.username);
            if let Err(e) = rpc.respond(&user.user_id, reply) {
                warn!("Failed to answer join request: {e}");
            }
        }

        std::thread::sleep(FRAME_TIME);
    }

    rpc.shutdown();

    let commands = companion.written_commands();
    info!(
        "Demo finished: {} presence updates published, {} commands seen by the companion over {} connections",
        editor.published(),
        commands.len(),
        companion.open_count()
    );
}
