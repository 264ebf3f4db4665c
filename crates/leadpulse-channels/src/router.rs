//! Channel router: picks the dispatcher named by the execution's channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use leadpulse_core::{ChannelDispatcher, DispatchError, DispatchReceipt, DispatchRequest};

use crate::log::LogDispatcher;

#[derive(Default)]
pub struct ChannelRouter {
    channels: HashMap<String, Arc<dyn ChannelDispatcher>>,
    fallback: Option<Arc<dyn ChannelDispatcher>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatcher under its own name. A later registration wins.
    pub fn register(&mut self, dispatcher: Arc<dyn ChannelDispatcher>) {
        let name = dispatcher.name().to_string();
        if self.channels.insert(name.clone(), dispatcher).is_some() {
            tracing::warn!("Channel '{name}' registered twice, keeping the latest");
        }
    }

    /// Dispatcher used for channels with no registration.
    pub fn with_fallback(mut self, fallback: Arc<dyn ChannelDispatcher>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Router that logs every dispatch instead of sending.
    pub fn dry_run() -> Self {
        Self::new().with_fallback(Arc::new(LogDispatcher::default()))
    }

    pub fn channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ChannelDispatcher for ChannelRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        match self.channels.get(&request.channel).or(self.fallback.as_ref()) {
            Some(dispatcher) => dispatcher.dispatch(request).await,
            None => Err(DispatchError::Permanent(format!(
                "no dispatcher for channel '{}'",
                request.channel
            ))),
        }
    }
}
