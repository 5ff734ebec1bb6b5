//! Handler traits and event types
//!
//! Extensions register opaque callables against event names; the hub calls
//! them with a [`HubApi`] capability and the event payload. Handlers run as
//! isolated tasks: a failure is logged and never reaches siblings.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use wmhub_protocol::ClickEvent;
use wmhub_utils::Result;

use crate::hub::HubApi;

/// Reserved event names
pub mod events {
    /// Wildcard bucket: subscriptions under this name receive every
    /// dispatched event.
    pub const WILDCARD: &str = "*";
    /// Delivered once per extension before any protocol event, carrying
    /// that extension's resolved configuration block.
    pub const INIT: &str = "hub::init";
    /// Delivered once during shutdown drain, awaited with a bounded
    /// timeout.
    pub const SHUTDOWN: &str = "hub::shutdown";
    /// Status output is being suspended (bar hidden).
    pub const STATUS_SUSPEND: &str = "hub::status_suspend";
    /// Status output resumed.
    pub const STATUS_RESUME: &str = "hub::status_resume";
}

/// A named, structured notification delivered to subscribed handlers
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: Arc<str>,
    pub body: Value,
}

impl Event {
    pub fn new(name: impl Into<Arc<str>>, body: Value) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

/// An event handler registered by an extension
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, api: HubApi, event: Event) -> Result<()>;
}

/// A click handler registered by an extension running in status mode
#[async_trait]
pub trait ClickHandler: Send + Sync {
    async fn handle(&self, api: HubApi, click: ClickEvent) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(HubApi, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, api: HubApi, event: Event) -> Result<()> {
        (self.0)(api, event).await
    }
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(HubApi, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnClickHandler<F>(F);

#[async_trait]
impl<F, Fut> ClickHandler for FnClickHandler<F>
where
    F: Fn(HubApi, ClickEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, api: HubApi, click: ClickEvent) -> Result<()> {
        (self.0)(api, click).await
    }
}

/// Wrap an async closure as a [`ClickHandler`]
pub fn click_fn<F, Fut>(f: F) -> Arc<dyn ClickHandler>
where
    F: Fn(HubApi, ClickEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnClickHandler(f))
}
