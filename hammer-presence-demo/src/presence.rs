//! Editor presence bridge: turns editor session state into rich presence.
//!
//! ## Data flow
//!
//! ```text
//!  editor event (map opened, tool switched, selection changed)
//!       │
//!       ▼
//!  EditorPresence::set_*()          ─── marks the presence dirty
//!       │
//!       ▼
//!  EditorPresence::publish()        ─── once per frame, only when dirty
//!       │
//!       ▼
//!  DiscordRpc::update_presence()
//! ```

use hammer_presence::{DiscordRpc, RichPresence, RpcError};

/// Editor state worth showing to friends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditorSession {
    pub map_name: Option<String>,
    pub tool: String,
    pub selected: usize,
    /// Unix seconds the map was opened
    pub opened_at: i64,
    /// Collaborative mapping session, joinable by others
    pub lobby: Option<Lobby>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lobby {
    pub id: String,
    pub members: i32,
    pub capacity: i32,
    pub join_secret: String,
}

/// Tracks the session and publishes it when it changes.
pub struct EditorPresence {
    session: EditorSession,
    /// Changed since the last publish
    dirty: bool,
    published: u64,
}

impl EditorPresence {
    pub fn new() -> Self {
        Self {
            session: EditorSession {
                tool: "Selection".into(),
                ..Default::default()
            },
            dirty: true,
            published: 0,
        }
    }

    pub fn session(&self) -> &EditorSession {
        &self.session
    }

    pub fn open_map(&mut self, name: &str, now: i64) {
        self.session.map_name = Some(name.to_owned());
        self.session.opened_at = now;
        self.session.selected = 0;
        self.dirty = true;
    }

    pub fn close_map(&mut self) {
        self.session.map_name = None;
        self.session.opened_at = 0;
        self.session.selected = 0;
        self.dirty = true;
    }

    pub fn set_tool(&mut self, tool: &str) {
        if self.session.tool != tool {
            self.session.tool = tool.to_owned();
            self.dirty = true;
        }
    }

    pub fn set_selection(&mut self, selected: usize) {
        if self.session.selected != selected {
            self.session.selected = selected;
            self.dirty = true;
        }
    }

    pub fn host_lobby(&mut self, lobby: Lobby) {
        self.session.lobby = Some(lobby);
        self.dirty = true;
    }

    /// A peer accepted into the lobby.
    pub fn add_member(&mut self) -> bool {
        match self.session.lobby.as_mut() {
            Some(lobby) if lobby.members < lobby.capacity => {
                lobby.members += 1;
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of presence updates handed to the client so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Push the session to `rpc` if it changed. Returns whether anything
    /// was sent.
    pub fn publish(&mut self, rpc: &DiscordRpc) -> Result<bool, RpcError> {
        if !self.dirty {
            return Ok(false);
        }

        let details = self.details();
        let state = self.state();
        match self.session.map_name.as_deref() {
            Some(map) => {
                let lobby = self.session.lobby.as_ref();
                rpc.update_presence(&RichPresence {
                    state: Some(&state),
                    details: Some(&details),
                    start_timestamp: self.session.opened_at,
                    large_image_key: Some("hammer"),
                    large_image_text: Some(map),
                    small_image_key: Some(tool_icon(&self.session.tool)),
                    small_image_text: Some(&self.session.tool),
                    party_id: lobby.map(|l| l.id.as_str()),
                    party_size: lobby.map_or(0, |l| l.members),
                    party_max: lobby.map_or(0, |l| l.capacity),
                    join_secret: lobby.map(|l| l.join_secret.as_str()),
                    ..Default::default()
                })?;
            }
            None => rpc.clear_presence()?,
        }

        log::debug!("Published presence: {details} / {state}");
        self.dirty = false;
        self.published += 1;
        Ok(true)
    }

    fn details(&self) -> String {
        match &self.session.map_name {
            Some(map) => format!("Editing {map}"),
            None => "Idle".into(),
        }
    }

    fn state(&self) -> String {
        match self.session.selected {
            0 => format!("{} tool", self.session.tool),
            1 => format!("{} tool, 1 object selected", self.session.tool),
            n => format!("{} tool, {n} objects selected", self.session.tool),
        }
    }
}

impl Default for EditorPresence {
    fn default() -> Self {
        Self::new()
    }
}

fn tool_icon(tool: &str) -> &'static str {
    match tool {
        "Block" => "tool-block",
        "Entity" => "tool-entity",
        "Texture" => "tool-texture",
        "Vertex" => "tool-vertex",
        _ => "tool-select",
    }
}

// ===================================================================
// Tests
// ===================================================================
