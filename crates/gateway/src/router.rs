//! Fan-out of inbound events to registered plugin handlers.
//!
//! Every keyed handler of every plugin runs in its own task, so a slow or
//! failing handler never delays the others. Handlers without a filter run
//! one after another in a single task per plugin, in key order.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
};

use {
    cqlink_protocol::Event,
    futures::FutureExt,
    tokio::task::JoinHandle,
    tracing::{debug, error, warn},
};

use crate::plugin::{FilterFn, HandlerFn};

struct Keyed {
    key: String,
    filter: FilterFn,
    handler: HandlerFn,
}

/// One plugin's handlers, split by whether they are filtered.
struct PluginEntry {
    name: String,
    keyed: Vec<Keyed>,
    always: Vec<(String, HandlerFn)>,
}

impl PluginEntry {
    fn build(
        name: &str,
        mut filters: HashMap<String, FilterFn>,
        handlers: HashMap<String, HandlerFn>,
    ) -> Self {
        let mut keyed = Vec::new();
        let mut always = Vec::new();
        for (key, handler) in handlers {
            match filters.remove(&key) {
                Some(filter) => keyed.push(Keyed {
                    key,
                    filter,
                    handler,
                }),
                None => always.push((key, handler)),
            }
        }

        let mut orphans: Vec<String> = filters.into_keys().collect();
        orphans.sort();
        for key in orphans {
            warn!(plugin = %name, key = %key, "filter has no matching handler, ignored");
        }

        keyed.sort_by(|a, b| a.key.cmp(&b.key));
        always.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            keyed,
            always,
        }
    }
}

#[derive(Default)]
pub struct EventRouter {
    plugins: RwLock<HashMap<String, Arc<PluginEntry>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin's filters and handlers under `name`.
    pub fn register(
        &self,
        name: &str,
        filters: HashMap<String, FilterFn>,
        handlers: HashMap<String, HandlerFn>,
    ) {
        let entry = Arc::new(PluginEntry::build(name, filters, handlers));
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        if plugins.insert(name.to_string(), entry).is_some() {
            warn!(plugin = %name, "plugin registered twice, previous registration replaced");
        }
        debug!(plugin = %name, total = plugins.len(), "plugin registered");
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start every handler for `event` and return without waiting.
    ///
    /// The returned handles complete when the corresponding handlers finish;
    /// callers are free to drop them.
    pub fn dispatch(&self, event: Event) -> Vec<JoinHandle<()>> {
        let event = Arc::new(event);
        let entries: Vec<Arc<PluginEntry>> = self
            .plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut tasks = Vec::new();
        for entry in entries {
            if !entry.always.is_empty() {
                let entry = Arc::clone(&entry);
                let event = Arc::clone(&event);
                tasks.push(tokio::spawn(async move {
                    for (key, handler) in &entry.always {
                        run_handler(&entry.name, key, handler, Arc::clone(&event)).await;
                    }
                }));
            }

            for index in 0..entry.keyed.len() {
                let entry = Arc::clone(&entry);
                let event = Arc::clone(&event);
                tasks.push(tokio::spawn(async move {
                    let keyed = &entry.keyed[index];
                    let accepted = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        (keyed.filter)(event.as_ref())
                    }));
                    match accepted {
                        Ok(true) => {
                            run_handler(&entry.name, &keyed.key, &keyed.handler, event).await;
                        },
                        Ok(false) => {},
                        Err(_) => {
                            error!(plugin = %entry.name, key = %keyed.key, "filter panicked");
                        },
                    }
                }));
            }
        }
        tasks
    }
}

async fn run_handler(plugin: &str, key: &str, handler: &HandlerFn, event: Arc<Event>) {
    let handler = Arc::clone(handler);
    let outcome = AssertUnwindSafe(async move { handler(event).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
            warn!(plugin = %plugin, key = %key, error = %e, "plugin handler failed");
        },
        Err(_) => {
            error!(plugin = %plugin, key = %key, "plugin handler panicked");
        },
    }
}
