//! JSON command writers and dispatch readers.
//!
//! Every outbound command is a small JSON object built from `serde` structs
//! whose field order matches what the companion expects. Optional fields are
//! skipped entirely when empty: the companion treats an absent key
//! differently from `null` or `""`, so `"assets": {}` or `"state": null`
//! must never reach the wire.
//!
//! Nonces are written as decimal strings, not JSON numbers.

use serde::Serialize;
use serde_json::Value;

use crate::connection::RpcError;
use crate::protocol::MAX_MESSAGE_SIZE;

/// The cosmetic status shown by the companion.
///
/// Borrowed fields: the caller keeps ownership, the value is serialized
/// immediately by [`crate::DiscordRpc::update_presence`]. Empty strings and
/// zero numbers count as "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RichPresence<'a> {
    pub state: Option<&'a str>,
    pub details: Option<&'a str>,
    /// Unix seconds, 0 = unset
    pub start_timestamp: i64,
    /// Unix seconds, 0 = unset
    pub end_timestamp: i64,
    pub large_image_key: Option<&'a str>,
    pub large_image_text: Option<&'a str>,
    pub small_image_key: Option<&'a str>,
    pub small_image_text: Option<&'a str>,
    pub party_id: Option<&'a str>,
    pub party_size: i32,
    pub party_max: i32,
    pub match_secret: Option<&'a str>,
    pub join_secret: Option<&'a str>,
    pub spectate_secret: Option<&'a str>,
    pub instance: bool,
}

/// A user as reported by the companion (the connected user, or someone
/// asking to join).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub discriminator: String,
    pub avatar: String,
}

/// Answer to a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    No,
    Yes,
    Ignore,
}

/// One serialized outbound command, at most [`MAX_MESSAGE_SIZE`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    bytes: Vec<u8>,
}

impl QueuedMessage {
    pub fn new(bytes: Vec<u8>) -> Result<Self, RpcError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(RpcError::MessageTooLarge {
                len: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire shapes
// ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Handshake<'a> {
    v: u32,
    client_id: &'a str,
}

#[derive(Serialize)]
struct EventCommand<'a> {
    nonce: String,
    cmd: &'static str,
    evt: &'a str,
}

#[derive(Serialize)]
struct SetActivity<'a> {
    nonce: String,
    cmd: &'static str,
    args: SetActivityArgs<'a>,
}

#[derive(Serialize)]
struct SetActivityArgs<'a> {
    pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity: Option<Activity<'a>>,
}

#[derive(Serialize)]
struct Activity<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamps: Option<Timestamps>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assets: Option<Assets<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    party: Option<Party<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secrets: Option<Secrets<'a>>,
    instance: bool,
}

#[derive(Serialize)]
struct Timestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<i64>,
}

#[derive(Serialize)]
struct Assets<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    large_image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    large_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    small_image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    small_text: Option<&'a str>,
}

#[derive(Serialize)]
struct Party<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<[i32; 2]>,
}

#[derive(Serialize)]
struct Secrets<'a> {
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    match_secret: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    join: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spectate: Option<&'a str>,
}

#[derive(Serialize)]
struct JoinReply<'a> {
    cmd: &'static str,
    args: JoinReplyArgs<'a>,
    nonce: String,
}

#[derive(Serialize)]
struct JoinReplyArgs<'a> {
    user_id: &'a str,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

fn non_zero(value: i64) -> Option<i64> {
    (value != 0).then_some(value)
}

impl<'a> From<&RichPresence<'a>> for Activity<'a> {
    fn from(presence: &RichPresence<'a>) -> Self {
        let timestamps = Timestamps {
            start: non_zero(presence.start_timestamp),
            end: non_zero(presence.end_timestamp),
        };
        let assets = Assets {
            large_image: non_empty(presence.large_image_key),
            large_text: non_empty(presence.large_image_text),
            small_image: non_empty(presence.small_image_key),
            small_text: non_empty(presence.small_image_text),
        };
        let party_id = non_empty(presence.party_id);
        let secrets = Secrets {
            match_secret: non_empty(presence.match_secret),
            join: non_empty(presence.join_secret),
            spectate: non_empty(presence.spectate_secret),
        };

        let has_timestamps = timestamps.start.is_some() || timestamps.end.is_some();
        let has_assets = assets.large_image.is_some()
            || assets.large_text.is_some()
            || assets.small_image.is_some()
            || assets.small_text.is_some();
        let has_party = party_id.is_some() || presence.party_size != 0 || presence.party_max != 0;
        let has_secrets =
            secrets.match_secret.is_some() || secrets.join.is_some() || secrets.spectate.is_some();

        Self {
            state: non_empty(presence.state),
            details: non_empty(presence.details),
            timestamps: has_timestamps.then_some(timestamps),
            assets: has_assets.then_some(assets),
            party: has_party.then(|| Party {
                id: party_id,
                size: (presence.party_size != 0 && presence.party_max != 0)
                    .then_some([presence.party_size, presence.party_max]),
            }),
            secrets: has_secrets.then_some(secrets),
            instance: presence.instance,
        }
    }
}

fn to_message<T: Serialize>(value: &T) -> Result<QueuedMessage, RpcError> {
    let mut buffer = Vec::with_capacity(256);
    serde_json::to_writer(&mut buffer, value)?;
    QueuedMessage::new(buffer)
}

// ───────────────────────────────────────────────────────────────────
// Writers
// ───────────────────────────────────────────────────────────────────

/// `{"v":1,"client_id":"..."}`: the payload of the `Handshake` frame.
pub fn write_handshake(version: u32, app_id: &str) -> Result<QueuedMessage, RpcError> {
    to_message(&Handshake {
        v: version,
        client_id: app_id,
    })
}

pub fn write_subscribe(nonce: u64, event: &str) -> Result<QueuedMessage, RpcError> {
    to_message(&EventCommand {
        nonce: nonce.to_string(),
        cmd: "SUBSCRIBE",
        evt: event,
    })
}

pub fn write_unsubscribe(nonce: u64, event: &str) -> Result<QueuedMessage, RpcError> {
    to_message(&EventCommand {
        nonce: nonce.to_string(),
        cmd: "UNSUBSCRIBE",
        evt: event,
    })
}

/// `SET_ACTIVITY` for `presence`, or a clearing `SET_ACTIVITY` (no
/// `activity` key) when `presence` is `None`.
pub fn write_rich_presence(
    nonce: u64,
    pid: u32,
    presence: Option<&RichPresence<'_>>,
) -> Result<QueuedMessage, RpcError> {
    to_message(&SetActivity {
        nonce: nonce.to_string(),
        cmd: "SET_ACTIVITY",
        args: SetActivityArgs {
            pid,
            activity: presence.map(Activity::from),
        },
    })
}

pub fn write_join_reply(user_id: &str, reply: Reply, nonce: u64) -> Result<QueuedMessage, RpcError> {
    let cmd = match reply {
        Reply::Yes => "SEND_ACTIVITY_JOIN_INVITE",
        Reply::No | Reply::Ignore => "CLOSE_ACTIVITY_JOIN_REQUEST",
    };
    to_message(&JoinReply {
        cmd,
        args: JoinReplyArgs { user_id },
        nonce: nonce.to_string(),
    })
}

// ───────────────────────────────────────────────────────────────────
// Readers
// ───────────────────────────────────────────────────────────────────

/// Object member `name` of `value`; `None` if either is missing or the
/// member is not an object.
pub fn get_obj_member<'a>(value: Option<&'a Value>, name: &str) -> Option<&'a Value> {
    value?.get(name).filter(|member| member.is_object())
}

pub fn get_str_member<'a>(value: Option<&'a Value>, name: &str) -> Option<&'a str> {
    value?.get(name)?.as_str()
}

/// Integer member `name`, 0 when missing or not an integer.
pub fn get_int_member(value: Option<&Value>, name: &str) -> i64 {
    value
        .and_then(|v| v.get(name))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Integer member `name` as an error code, saturated to the `i32` range.
pub fn get_code_member(value: Option<&Value>, name: &str) -> i32 {
    let code = get_int_member(value, name);
    i32::try_from(code).unwrap_or(if code < 0 { i32::MIN } else { i32::MAX })
}

/// Parse a `{"id","username","discriminator","avatar"}` object. `id` and
/// `username` are required; the other two default to empty.
pub fn parse_user(value: Option<&Value>) -> Option<User> {
    let user_id = get_str_member(value, "id")?;
    let username = get_str_member(value, "username")?;
    Some(User {
        user_id: user_id.to_owned(),
        username: username.to_owned(),
        discriminator: get_str_member(value, "discriminator")
            .unwrap_or_default()
            .to_owned(),
        avatar: get_str_member(value, "avatar").unwrap_or_default().to_owned(),
    })
}
