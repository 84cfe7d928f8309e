use std::{collections::HashMap, future::Future, sync::Arc};

use {
    anyhow::Result, async_trait::async_trait, cqlink_protocol::Event, futures::future::BoxFuture,
    serde_json::Value,
};

use crate::client::CqClient;

/// Synchronous predicate deciding whether a handler sees an event.
pub type FilterFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Asynchronous event handler. Errors are logged by the router.
pub type HandlerFn = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn filter<F>(f: F) -> FilterFn
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// A unit of bot behaviour.
///
/// Handlers are keyed by name. A handler whose key also has a filter only
/// runs when the filter accepts the event; handlers without a filter run for
/// every event. Filters without a handler are ignored with a warning.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registration key. A later plugin with the same name replaces this one.
    fn name(&self) -> &str;

    /// Called once before registration. An error skips the plugin.
    async fn load(&self, _client: CqClient) -> Result<()> {
        Ok(())
    }

    fn filters(&self) -> HashMap<String, FilterFn> {
        HashMap::new()
    }

    fn handlers(&self) -> HashMap<String, HandlerFn>;

    /// Runs in the background once every plugin is registered.
    async fn on_loaded(&self) {}

    /// Push-channel module this plugin answers for.
    fn module(&self) -> Option<&str> {
        None
    }

    /// Payload of a non-system push frame addressed to [`Self::module`].
    async fn on_push(&self, _payload: Value) -> Result<()> {
        Ok(())
    }
}
