//! command.rs
//! Client command parsing and application.
//!
//! Wire format: one JSON object per line, `{"action": "...", "params": [...]}`.
//! Anything that does not parse into a known action is dropped without reply.

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::sensor::channel::ChannelMask;
use crate::server::session::{ClientId, ServerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Replace the session mask with the union of the recognized names.
    ConfigChannels(ChannelMask),
    StartSend,
    StopSend,
    Disconnect,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    action: String,
    #[serde(default)]
    params: Option<Vec<Value>>,
}

impl Command {
    /// Parses one line. Unknown channel names and non-string params are
    /// ignored; malformed JSON or an unknown action yields `None`.
    pub fn parse(line: &[u8]) -> Option<Self> {
        let raw: RawCommand = serde_json::from_slice(line).ok()?;
        match raw.action.as_str() {
            "config_channels" => {
                let mask = raw
                    .params
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(ChannelMask::from_command_name)
                    .fold(ChannelMask::NONE, |acc, m| acc | m);
                Some(Self::ConfigChannels(mask))
            }
            "start_send" => Some(Self::StartSend),
            "stop_send" => Some(Self::StopSend),
            "disconnect" => Some(Self::Disconnect),
            _ => None,
        }
    }
}

impl ServerState {
    /// Applies a command for `id` and re-arbitrates. Returns `false` once the
    /// session is gone so the caller stops feeding it further lines.
    pub fn apply_command(&mut self, id: ClientId, cmd: Command) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        match cmd {
            Command::ConfigChannels(mask) => {
                info!("[Command] client {} channels -> {}", id, mask.describe());
                session.mask = mask;
            }
            Command::StartSend => {
                debug!("[Command] client {} start_send", id);
                session.streaming = true;
            }
            Command::StopSend => {
                debug!("[Command] client {} stop_send", id);
                session.streaming = false;
            }
            Command::Disconnect => {
                info!("[Command] client {} requested disconnect", id);
                self.remove_client(id);
                return false;
            }
        }
        self.arbitrate();
        true
    }
}
