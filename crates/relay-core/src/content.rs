//! Content-context service: scans the current page on request.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use protocol::{ContentTrigger, MessageType};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::detector::{Detector, PageText};
use crate::error::{RelayError, RelayResult};
use crate::relay::DataRelay;
use crate::router::handler_fn;

/// Supplies the text of the page currently loaded in the context.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page(&self) -> RelayResult<PageText>;
}

/// Fixed page, replaceable at runtime.
#[derive(Default)]
pub struct StaticPage {
    page: RwLock<PageText>,
}

impl StaticPage {
    pub fn new(url: Option<String>, text: impl Into<String>) -> Self {
        Self { page: RwLock::new(PageText { url, text: text.into() }) }
    }

    pub fn navigate(&self, url: Option<String>, text: impl Into<String>) {
        *self.page.write() = PageText { url, text: text.into() };
    }
}

#[async_trait]
impl PageSource for StaticPage {
    async fn page(&self) -> RelayResult<PageText> {
        Ok(self.page.read().clone())
    }
}

pub struct ContentScript {
    relay: Arc<DataRelay>,
    source: Arc<dyn PageSource>,
    detector: Arc<dyn Detector<Input = PageText, Output = ContentTrigger>>,
}

impl ContentScript {
    pub fn new(
        relay: Arc<DataRelay>,
        source: Arc<dyn PageSource>,
        detector: Arc<dyn Detector<Input = PageText, Output = ContentTrigger>>,
    ) -> Arc<Self> {
        Arc::new(Self { relay, source, detector })
    }

    pub fn install(self: &Arc<Self>) -> RelayResult<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.relay.register_handler(
            MessageType::AnalyzePage.as_str(),
            handler_fn(move |_| {
                let script = weak.upgrade();
                async move {
                    let script = script?;
                    Some(match script.analyze().await {
                        Ok(trigger) => json!({ "success": true, "trigger": trigger }),
                        Err(e) => json!({ "error": e.to_string() }),
                    })
                }
            }),
        )
    }

    /// Scan the current page and publish the result as a `CONTENT_TRIGGER`.
    pub async fn analyze(&self) -> RelayResult<Value> {
        let page = self.source.page().await?;
        if page.text.trim().is_empty() {
            return Err(RelayError::MalformedMessage("page has no text".to_string()));
        }
        let trigger = self.detector.detect(page).await?;
        match self.relay.publish_event(MessageType::ContentTrigger, &trigger).await {
            Ok(record) => {
                debug!(triggers = trigger.triggers.len(), "page analyzed");
                Ok(record.to_value())
            }
            Err(e) => {
                warn!(error = %e, "page analysis not published");
                Err(e)
            }
        }
    }
}
