//! Runtime wiring: the three backend sockets, plugin loading and the
//! correlation sweeper.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    cqlink_config::CqlinkConfig,
    cqlink_protocol::{API_PATH, CommandResponse, EVENT_PATH, Event, PushCode, PushFrame, PushKind},
    cqlink_socket::{ResilientSocket, SocketConfig, SocketHandler},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{client::CqClient, correlation::CorrelationTable, plugin::Plugin, router::EventRouter};

type ModuleMap = HashMap<String, Arc<dyn Plugin>>;

// ── Socket handlers ─────────────────────────────────────────────────────────

/// Api channel: matches responses against pending echo tokens.
struct ApiHandler {
    table: Arc<CorrelationTable>,
}

#[async_trait]
impl SocketHandler for ApiHandler {
    async fn on_connect(&self) {
        info!("api channel connected");
    }

    async fn on_message(&self, payload: Vec<u8>) {
        let response: CommandResponse = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "undecodable api response dropped");
                return;
            },
        };
        let Some(echo) = response.echo else {
            debug!(retcode = response.retcode, "api response without echo");
            return;
        };
        if !self.table.resolve(echo) {
            debug!(echo, "response for unknown or expired command");
        }
        if response.is_ok() {
            debug!(echo, "command succeeded");
        } else {
            warn!(
                echo,
                retcode = response.retcode,
                status = %response.status,
                "command rejected by backend"
            );
        }
    }
}

/// Event channel: decodes events and fans them out to plugins.
struct EventHandler {
    router: Arc<EventRouter>,
}

#[async_trait]
impl SocketHandler for EventHandler {
    async fn on_connect(&self) {
        info!("event channel connected");
    }

    async fn on_message(&self, payload: Vec<u8>) {
        match serde_json::from_slice::<Event>(&payload) {
            Ok(event) => {
                debug!(
                    post_type = %event.post_type,
                    message_type = %event.message_type,
                    "event received"
                );
                self.router.dispatch(event);
            },
            Err(e) => warn!(error = %e, "undecodable event dropped"),
        }
    }

    fn accepts(&self, payload: &[u8]) -> bool {
        payload.first() == Some(&b'{')
    }
}

/// Push channel: logs system frames, routes the rest by module.
struct PushHandler {
    modules: Arc<OnceLock<ModuleMap>>,
}

#[async_trait]
impl SocketHandler for PushHandler {
    async fn on_connect(&self) {
        info!("push channel connected");
    }

    async fn on_message(&self, payload: Vec<u8>) {
        let frame: PushFrame = match serde_json::from_slice(&payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "undecodable push frame dropped");
                return;
            },
        };

        match frame.kind {
            PushKind::System => match frame.code {
                PushCode::Success => info!(payload = %frame.payload, "push server notice"),
                PushCode::Fail => warn!(payload = %frame.payload, "push server reported failure"),
                PushCode::Error => error!(payload = %frame.payload, "push server reported error"),
            },
            PushKind::NonSystem => {
                let plugin = self
                    .modules
                    .get()
                    .and_then(|modules| modules.get(&frame.module))
                    .cloned();
                let Some(plugin) = plugin else {
                    warn!(module = %frame.module, "push frame for unknown module");
                    return;
                };
                if let Err(e) = plugin.on_push(frame.payload).await {
                    warn!(
                        plugin = %plugin.name(),
                        module = %frame.module,
                        error = %e,
                        "push callback failed"
                    );
                }
            },
        }
    }
}

// ── Gateway ─────────────────────────────────────────────────────────────────

pub struct Gateway {
    client: CqClient,
    api: ResilientSocket,
    event: ResilientSocket,
    push: Option<ResilientSocket>,
    table: Arc<CorrelationTable>,
    router: Arc<EventRouter>,
    plugins: Vec<Arc<dyn Plugin>>,
    config: CqlinkConfig,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Gateway {
    /// Create the sockets, load `plugins` and register their handlers.
    ///
    /// Nothing is dialled until [`Gateway::start`].
    pub async fn build(config: CqlinkConfig, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let timing = &config.timing;
        let table = Arc::new(CorrelationTable::new(timing.command_timeout()));
        let router = Arc::new(EventRouter::new());
        let modules: Arc<OnceLock<ModuleMap>> = Arc::new(OnceLock::new());

        let base = config.backend.ws_url.trim_end_matches('/');
        let socket_config = |name: &str, url: String| {
            let mut sc = SocketConfig::new(name, url);
            sc.keepalive_interval = timing.keepalive();
            sc.reconnect_interval = timing.reconnect();
            sc
        };
        let with_auth = |mut sc: SocketConfig| {
            if let Some(auth) = config.backend.authorization() {
                sc = sc.with_header("Authorization", auth);
            }
            sc
        };

        let api = ResilientSocket::new(
            with_auth(socket_config("api", format!("{base}{API_PATH}"))),
            Arc::new(ApiHandler {
                table: Arc::clone(&table),
            }),
        );
        let event = ResilientSocket::new(
            with_auth(socket_config("event", format!("{base}{EVENT_PATH}"))),
            Arc::new(EventHandler {
                router: Arc::clone(&router),
            }),
        );
        let push = config.push.as_ref().map(|push| {
            let mut sc = socket_config("push", push.url.clone());
            if let Some(token) = &push.token {
                sc = sc.with_header("x-access-token", token.clone());
            }
            ResilientSocket::new(
                sc,
                Arc::new(PushHandler {
                    modules: Arc::clone(&modules),
                }),
            )
        });

        let client = CqClient::new(
            api.clone(),
            event.clone(),
            push.clone(),
            Arc::clone(&table),
            &config.backend,
        );

        let mut loaded: Vec<Arc<dyn Plugin>> = Vec::new();
        for plugin in plugins {
            match plugin.load(client.clone()).await {
                Ok(()) => {
                    debug!(plugin = %plugin.name(), "plugin loaded");
                    loaded.push(plugin);
                },
                Err(e) => {
                    error!(plugin = %plugin.name(), error = %e, "plugin failed to load, skipped");
                },
            }
        }

        let mut module_map = ModuleMap::new();
        for plugin in &loaded {
            router.register(plugin.name(), plugin.filters(), plugin.handlers());
            if let Some(module) = plugin.module()
                && module_map
                    .insert(module.to_string(), Arc::clone(plugin))
                    .is_some()
            {
                warn!(module = %module, plugin = %plugin.name(), "push module claimed twice");
            }
        }
        let _ = modules.set(module_map);
        info!(plugins = router.len(), "plugins registered");

        Self {
            client,
            api,
            event,
            push,
            table,
            router,
            plugins: loaded,
            config,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    pub fn client(&self) -> &CqClient {
        &self.client
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Connect every socket (retrying in the background when the backend is
    /// down), start the sweeper and run each plugin's `on_loaded` hook.
    pub async fn start(&self) {
        self.table
            .spawn_sweeper(self.config.timing.sweep_interval(), self.cancel.child_token());

        let push = async {
            if let Some(push) = &self.push {
                push.start().await;
            }
        };
        tokio::join!(self.api.start(), self.event.start(), push);

        for plugin in &self.plugins {
            let plugin = Arc::clone(plugin);
            tokio::spawn(async move { plugin.on_loaded().await });
        }
        info!("gateway started");
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let push = async {
            if let Some(push) = &self.push {
                push.close().await;
            }
        };
        tokio::join!(self.api.close(), self.event.close(), push);
        info!("gateway stopped");
    }
}
