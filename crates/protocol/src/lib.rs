//! Bot backend wire protocol.
//!
//! All socket traffic is JSON. Two logical endpoints are used against the
//! backend:
//! - the command channel (`<ws_url>/api`) carries [`OutboundCommand`]s and
//!   their [`CommandResponse`]s, correlated through the `echo` token;
//! - the event channel (`<ws_url>/event`) carries inbound [`Event`]s only.
//!
//! An optional push channel exchanges [`PushFrame`] envelopes with an
//! auxiliary server. Chat message text uses the bracket segment format
//! implemented in [`message`].

pub mod message;

use serde::{Deserialize, Serialize};

pub use message::{Message, Segment, SyntaxError, escape, unescape};

// ── Constants ────────────────────────────────────────────────────────────────

/// Interval between keepalive pings on an idle socket.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 5;
/// Delay between reconnect attempts.
pub const RECONNECT_INTERVAL_SECS: u64 = 5;
/// How long a command may wait for its response before it is reported.
pub const COMMAND_TIMEOUT_SECS: u64 = 30;
/// Interval of the pending-command sweep.
pub const SWEEP_INTERVAL_SECS: u64 = 30;

/// Path appended to the websocket base URL for the command channel.
pub const API_PATH: &str = "/api";
/// Path appended to the websocket base URL for the event channel.
pub const EVENT_PATH: &str = "/event";
/// Path appended to the HTTP base URL for the status call.
pub const STATUS_PATH: &str = "/get_status";

// ── Outbound commands ────────────────────────────────────────────────────────

/// Backend actions the gateway knows how to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SendPrivateMsg,
    SendGroupMsg,
    SetGroupKick,
    SetGroupBan,
    SetGroupWholeBan,
    SetGroupSpecialTitle,
    GetGroupMemberList,
    GetStatus,
    SetRestartPlugin,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendPrivateMsg => "send_private_msg",
            Self::SendGroupMsg => "send_group_msg",
            Self::SetGroupKick => "set_group_kick",
            Self::SetGroupBan => "set_group_ban",
            Self::SetGroupWholeBan => "set_group_whole_ban",
            Self::SetGroupSpecialTitle => "set_group_special_title",
            Self::GetGroupMemberList => "get_group_member_list",
            Self::GetStatus => "get_status",
            Self::SetRestartPlugin => "set_restart_plugin",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter payload bound to exactly one [`Action`].
pub trait ActionParams: Serialize {
    const ACTION: Action;
}

/// Client → backend command frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub action: Action,
    pub params: serde_json::Value,
    pub echo: i64,
}

impl OutboundCommand {
    pub fn new<P: ActionParams>(params: &P, echo: i64) -> serde_json::Result<Self> {
        Ok(Self {
            action: P::ACTION,
            params: serde_json::to_value(params)?,
            echo,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPrivateMsg {
    pub user_id: i64,
    pub message: String,
    #[serde(default)]
    pub auto_escape: bool,
}

impl ActionParams for SendPrivateMsg {
    const ACTION: Action = Action::SendPrivateMsg;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendGroupMsg {
    pub group_id: i64,
    pub message: String,
    #[serde(default)]
    pub auto_escape: bool,
}

impl ActionParams for SendGroupMsg {
    const ACTION: Action = Action::SendGroupMsg;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetGroupKick {
    pub group_id: i64,
    pub user_id: i64,
    /// Also reject future join requests from this user.
    pub reject_add_request: bool,
}

impl ActionParams for SetGroupKick {
    const ACTION: Action = Action::SetGroupKick;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetGroupBan {
    pub group_id: i64,
    pub user_id: i64,
    /// Ban length in seconds; `0` lifts the ban.
    pub duration: i64,
}

impl ActionParams for SetGroupBan {
    const ACTION: Action = Action::SetGroupBan;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetGroupWholeBan {
    pub group_id: i64,
    pub enable: bool,
}

impl ActionParams for SetGroupWholeBan {
    const ACTION: Action = Action::SetGroupWholeBan;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetGroupSpecialTitle {
    pub group_id: i64,
    pub user_id: i64,
    pub special_title: String,
    /// Seconds the title stays valid; `-1` means permanent.
    pub duration: i64,
}

impl ActionParams for SetGroupSpecialTitle {
    const ACTION: Action = Action::SetGroupSpecialTitle;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetGroupMemberList {
    pub group_id: i64,
}

impl ActionParams for GetGroupMemberList {
    const ACTION: Action = Action::GetGroupMemberList;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRestartPlugin {
    /// Delay in milliseconds before the backend restarts.
    pub delay: i64,
}

impl ActionParams for SetRestartPlugin {
    const ACTION: Action = Action::SetRestartPlugin;
}

// ── Responses ────────────────────────────────────────────────────────────────

/// Backend → client reply to an [`OutboundCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub retcode: i32,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub echo: Option<i64>,
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        self.retcode == 0
    }
}

/// Health flags returned by the status call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendStatus {
    pub app_initialized: bool,
    pub app_enabled: bool,
    pub plugins_good: bool,
    pub app_good: bool,
    pub online: bool,
    pub good: bool,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Inbound notification from the event channel.
///
/// Only message events carry every field; notices and requests leave the
/// message-specific ones at their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub post_type: String,
    pub message_type: String,
    pub sub_type: String,
    pub group_id: i64,
    pub user_id: i64,
    pub self_id: i64,
    /// Raw wire text, see [`Event::decode_message`].
    pub message: String,
    pub message_id: i64,
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<Anonymous>,
    pub font: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Anonymous {
    pub id: i64,
    pub name: String,
    pub flag: String,
}

impl Event {
    pub fn is_message(&self) -> bool {
        self.post_type == "message"
    }

    pub fn is_group_message(&self) -> bool {
        self.is_message() && self.message_type == "group"
    }

    pub fn is_private_message(&self) -> bool {
        self.is_message() && self.message_type == "private"
    }

    /// Parse the raw message text into segments.
    pub fn decode_message(&self) -> Result<Message, SyntaxError> {
        Message::decode(&self.message)
    }
}

// ── Push channel ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushCode {
    Success,
    Fail,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// Server bookkeeping, only logged.
    System,
    /// Routed to the plugin owning `module`.
    NonSystem,
}

/// Envelope exchanged over the auxiliary push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub code: PushCode,
    pub kind: PushKind,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of a [`PushKind::System`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub msg_type: String,
    pub data: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn command_serializes_to_wire_shape() {
        let params = SendGroupMsg {
            group_id: 42,
            message: "hi".into(),
            auto_escape: false,
        };
        let cmd = OutboundCommand::new(&params, 7).unwrap();
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "send_group_msg");
        assert_eq!(json["params"]["group_id"], 42);
        assert_eq!(json["params"]["message"], "hi");
        assert_eq!(json["echo"], 7);
    }

    #[test]
    fn action_names_match_serde() {
        for action in [
            Action::SendPrivateMsg,
            Action::SetGroupKick,
            Action::SetGroupSpecialTitle,
            Action::SetRestartPlugin,
        ] {
            let json = serde_json::to_value(action).unwrap();
            assert_eq!(json, action.as_str());
        }
    }

    #[test]
    fn response_with_null_data() {
        let raw = r#"{"status":"failed","retcode":102,"data":null,"echo":1700000000}"#;
        let resp: CommandResponse = serde_json::from_str(raw).unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.echo, Some(1_700_000_000));
        assert!(resp.data.is_none());
    }

    #[test]
    fn group_message_event() {
        let raw = r#"{
            "post_type": "message",
            "message_type": "group",
            "sub_type": "normal",
            "group_id": 123,
            "user_id": 456,
            "self_id": 789,
            "message": "hello[CQ:face,id=14]",
            "message_id": 1,
            "time": 1600000000,
            "anonymous": null,
            "font": 0
        }"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(event.is_group_message());
        assert!(event.anonymous.is_none());
        let msg = event.decode_message().unwrap();
        assert_eq!(msg.segments().len(), 2);
    }

    #[test]
    fn notice_event_tolerates_missing_fields() {
        let raw = r#"{"post_type":"notice","notice_type":"group_increase","group_id":1,"time":5}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(!event.is_message());
        assert_eq!(event.group_id, 1);
        assert!(event.message.is_empty());
    }

    #[test]
    fn anonymous_sender() {
        let raw = r#"{"post_type":"message","message_type":"group",
            "anonymous":{"id":9,"name":"ghost","flag":"abc"}}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        let anon = event.anonymous.unwrap();
        assert_eq!(anon.name, "ghost");
        assert_eq!(anon.flag, "abc");
    }

    #[test]
    fn push_frame_shape() {
        let raw = r#"{"code":"success","kind":"non_system","module":"news","payload":{"n":1}}"#;
        let frame: PushFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.kind, PushKind::NonSystem);
        assert_eq!(frame.module, "news");
        assert_eq!(frame.payload["n"], 1);
    }
}
