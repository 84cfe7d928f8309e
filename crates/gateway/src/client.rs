//! Handle plugins use to talk to the bot backend.

use std::{sync::Arc, time::Duration};

use {
    cqlink_config::BackendConfig,
    cqlink_protocol::{
        ActionParams, BackendStatus, CommandResponse, GetGroupMemberList, Message,
        OutboundCommand, PushCode, PushFrame, PushKind, STATUS_PATH, SendGroupMsg,
        SendPrivateMsg, SetGroupBan, SetGroupKick, SetGroupSpecialTitle, SetGroupWholeBan,
        SetRestartPlugin, SystemNotice,
    },
    cqlink_socket::ResilientSocket,
    reqwest::header::AUTHORIZATION,
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    correlation::{CorrelationTable, next_token},
    error::{Error, Result},
};

struct ClientInner {
    api: ResilientSocket,
    event: ResilientSocket,
    push: Option<ResilientSocket>,
    table: Arc<CorrelationTable>,
    http: reqwest::Client,
    http_url: String,
    authorization: Option<Secret<String>>,
}

/// Cheap to clone; every clone shares the same sockets and pending table.
///
/// Command methods return the echo token once the frame is written. The
/// backend's reply is matched on the api channel and only logged.
#[derive(Clone)]
pub struct CqClient {
    inner: Arc<ClientInner>,
}

impl CqClient {
    pub(crate) fn new(
        api: ResilientSocket,
        event: ResilientSocket,
        push: Option<ResilientSocket>,
        table: Arc<CorrelationTable>,
        backend: &BackendConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                api,
                event,
                push,
                table,
                http: reqwest::Client::new(),
                http_url: backend.http_url.trim_end_matches('/').to_string(),
                authorization: backend.authorization(),
            }),
        }
    }

    pub fn is_api_connected(&self) -> bool {
        self.inner.api.is_connected()
    }

    pub fn is_event_connected(&self) -> bool {
        self.inner.event.is_connected()
    }

    /// `None` when no push channel is configured.
    pub fn is_push_connected(&self) -> Option<bool> {
        self.inner.push.as_ref().map(ResilientSocket::is_connected)
    }

    /// Commands sent but not yet answered or expired.
    pub fn pending_commands(&self) -> usize {
        self.inner.table.len()
    }

    async fn call<P: ActionParams>(&self, params: &P) -> Result<i64> {
        let token = next_token();
        let frame = serde_json::to_string(&OutboundCommand::new(params, token)?)?;

        self.inner.table.register(token);
        if let Err(e) = self.inner.api.send_text(frame).await {
            self.inner.table.resolve(token);
            return Err(e.into());
        }
        debug!(action = %P::ACTION, echo = token, "command sent");
        Ok(token)
    }

    pub async fn send_private_msg(&self, user_id: i64, message: &Message) -> Result<i64> {
        self.call(&SendPrivateMsg {
            user_id,
            message: message.encode(),
            auto_escape: false,
        })
        .await
    }

    pub async fn send_group_msg(&self, group_id: i64, message: &Message) -> Result<i64> {
        self.call(&SendGroupMsg {
            group_id,
            message: message.encode(),
            auto_escape: false,
        })
        .await
    }

    pub async fn set_group_kick(
        &self,
        group_id: i64,
        user_id: i64,
        reject_add_request: bool,
    ) -> Result<i64> {
        self.call(&SetGroupKick {
            group_id,
            user_id,
            reject_add_request,
        })
        .await
    }

    /// Mute a member. A zero duration lifts the mute.
    pub async fn set_group_ban(
        &self,
        group_id: i64,
        user_id: i64,
        duration: Duration,
    ) -> Result<i64> {
        self.call(&SetGroupBan {
            group_id,
            user_id,
            duration: whole_secs(duration),
        })
        .await
    }

    pub async fn set_group_whole_ban(&self, group_id: i64, enable: bool) -> Result<i64> {
        self.call(&SetGroupWholeBan { group_id, enable }).await
    }

    /// `duration` of `None` keeps the title forever.
    pub async fn set_group_special_title(
        &self,
        group_id: i64,
        user_id: i64,
        special_title: &str,
        duration: Option<Duration>,
    ) -> Result<i64> {
        self.call(&SetGroupSpecialTitle {
            group_id,
            user_id,
            special_title: special_title.to_string(),
            duration: duration.map_or(-1, whole_secs),
        })
        .await
    }

    pub async fn get_group_member_list(&self, group_id: i64) -> Result<i64> {
        self.call(&GetGroupMemberList { group_id }).await
    }

    pub async fn set_restart_plugin(&self, delay: Duration) -> Result<i64> {
        self.call(&SetRestartPlugin {
            delay: whole_millis(delay),
        })
        .await
    }

    /// Check backend health over HTTP. Any failure is logged and yields
    /// `None`.
    pub async fn status(&self) -> Option<BackendStatus> {
        match self.fetch_status().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "backend status check failed");
                None
            },
        }
    }

    async fn fetch_status(&self) -> Result<BackendStatus> {
        let url = format!("{}{STATUS_PATH}", self.inner.http_url);
        let mut request = self.inner.http.get(url);
        if let Some(auth) = &self.inner.authorization {
            request = request.header(AUTHORIZATION, auth.expose_secret());
        }
        let response: CommandResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.is_ok() {
            return Err(Error::Backend(response.retcode));
        }
        Ok(serde_json::from_value(
            response.data.unwrap_or(Value::Null),
        )?)
    }

    /// Send `payload` to the push server on behalf of `module`.
    pub async fn push(&self, module: &str, payload: Value) -> Result<()> {
        self.send_push(PushFrame {
            code: PushCode::Success,
            kind: PushKind::NonSystem,
            module: module.to_string(),
            payload,
        })
        .await
    }

    /// Send a system notice to the push server.
    pub async fn push_system(&self, code: PushCode, msg_type: &str, data: &str) -> Result<()> {
        let notice = SystemNotice {
            msg_type: msg_type.to_string(),
            data: data.to_string(),
        };
        self.send_push(PushFrame {
            code,
            kind: PushKind::System,
            module: String::new(),
            payload: serde_json::to_value(notice)?,
        })
        .await
    }

    async fn send_push(&self, frame: PushFrame) -> Result<()> {
        let socket = self.inner.push.as_ref().ok_or(Error::PushDisabled)?;
        socket.send_text(serde_json::to_string(&frame)?).await?;
        Ok(())
    }
}

fn whole_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn whole_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
