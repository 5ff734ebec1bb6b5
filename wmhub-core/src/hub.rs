//! Hub assembly: the builder, the shared runtime state, and the [`HubApi`]
//! capability handed to every handler invocation.
//!
//! Handlers never touch the connection directly. Everything they may do
//! goes through a `HubApi` scoped to their extension id: issuing commands,
//! emitting custom events, updating their status block, or changing their
//! own subscriptions.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error};

use wmhub_protocol::{CommandKind, EventKind};
use wmhub_utils::{paths, HubError, Result};

use crate::extension::{ClickHandler, Event, EventHandler};
use crate::gateway::CommandGateway;
use crate::lifecycle::{ConnectionState, ReconnectPolicy};
use crate::router::{Router, SubscriptionHandle};
use crate::status::{ClickRegistry, StatusOptions, StatusOutput, StatusStreams};

/// State shared between the lifecycle loop and every `HubApi` clone
pub(crate) struct ApiShared {
    pub(crate) router: Router,
    /// Replaced on every (re)connect, cleared during drain
    pub(crate) gateway: Mutex<Option<CommandGateway>>,
    pub(crate) status: Mutex<Option<StatusOutput>>,
    pub(crate) clicks: Arc<ClickRegistry>,
    pub(crate) state_rx: watch::Receiver<ConnectionState>,
    pub(crate) command_timeout: Duration,
    pub(crate) running_as_status: bool,
}

impl ApiShared {
    pub(crate) fn current_gateway(&self) -> Option<CommandGateway> {
        self.gateway.lock().expect("gateway lock poisoned").clone()
    }

    pub(crate) fn current_status(&self) -> Option<StatusOutput> {
        self.status.lock().expect("status lock poisoned").clone()
    }
}

/// Capability passed to handlers, scoped to one extension
#[derive(Clone)]
pub struct HubApi {
    shared: Arc<ApiShared>,
    extension: Arc<str>,
}

impl HubApi {
    pub(crate) fn scoped(shared: Arc<ApiShared>, extension: &str) -> HubApi {
        HubApi {
            shared,
            extension: Arc::from(extension),
        }
    }

    /// The extension this capability is scoped to
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Whether the hub is speaking the status protocol on stdio
    pub fn running_as_status(&self) -> bool {
        self.shared.running_as_status
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_rx.borrow()
    }

    /// Per-user runtime directory for extension scratch state
    pub fn runtime_dir(&self) -> PathBuf {
        paths::runtime_dir()
    }

    async fn call(&self, kind: CommandKind, payload: String) -> Result<Value> {
        match self.state() {
            ConnectionState::Draining | ConnectionState::Closed => {
                return Err(HubError::ShuttingDown)
            }
            _ => {}
        }
        match self.shared.current_gateway() {
            Some(gateway) => {
                gateway
                    .call(kind, payload, self.shared.command_timeout)
                    .await
            }
            None => Err(HubError::ConnectionLost),
        }
    }

    /// Run a window manager command string, e.g. `"workspace 3"`.
    pub async fn run_command(&self, command: impl Into<String>) -> Result<Value> {
        self.call(CommandKind::RunCommand, command.into()).await
    }

    pub async fn get_workspaces(&self) -> Result<Value> {
        self.call(CommandKind::GetWorkspaces, String::new()).await
    }

    pub async fn get_outputs(&self) -> Result<Value> {
        self.call(CommandKind::GetOutputs, String::new()).await
    }

    pub async fn get_tree(&self) -> Result<Value> {
        self.call(CommandKind::GetTree, String::new()).await
    }

    pub async fn get_marks(&self) -> Result<Value> {
        self.call(CommandKind::GetMarks, String::new()).await
    }

    /// Without a bar id, returns the list of bar ids.
    pub async fn get_bar_config(&self, bar_id: Option<&str>) -> Result<Value> {
        self.call(CommandKind::GetBarConfig, bar_id.unwrap_or_default().into())
            .await
    }

    pub async fn get_version(&self) -> Result<Value> {
        self.call(CommandKind::GetVersion, String::new()).await
    }

    pub async fn get_binding_modes(&self) -> Result<Value> {
        self.call(CommandKind::GetBindingModes, String::new()).await
    }

    pub async fn get_config(&self) -> Result<Value> {
        self.call(CommandKind::GetConfig, String::new()).await
    }

    /// Broadcast a tick event to every IPC client subscribed to ticks.
    pub async fn send_tick(&self, payload: Option<&str>) -> Result<Value> {
        self.call(CommandKind::SendTick, payload.unwrap_or_default().into())
            .await
    }

    /// Emit a custom event through the router. Fire-and-forget: matching
    /// handlers run as independent tasks.
    pub fn emit(&self, event: impl Into<Arc<str>>, body: Value) {
        dispatch_event(&self.shared, Event::new(event, body));
    }

    /// Replace this extension's status block content; `None` hides it.
    pub fn set_status(&self, content: Option<Value>) -> Result<()> {
        match self.shared.current_status() {
            Some(status) => status.update(&self.extension, content),
            None => Err(HubError::config("status output is not enabled")),
        }
    }

    /// Re-render the status line without changing any content.
    pub fn refresh_status(&self) -> Result<()> {
        match self.shared.current_status() {
            Some(status) => status.refresh(),
            None => Err(HubError::config("status output is not enabled")),
        }
    }

    /// Subscribe a handler at runtime. If the event is a protocol event
    /// the connection has not subscribed to yet, an incremental subscribe
    /// command goes out in the background.
    pub fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>) -> SubscriptionHandle {
        // Checked before the table changes: an event the session already
        // subscribed to must not go out on the wire again
        let not_yet_on_wire = EventKind::from_name(event)
            .filter(|kind| !self.shared.router.protocol_events().contains(kind));
        let handle = self.shared.router.subscribe(event, &self.extension, handler);
        if let Some(kind) = not_yet_on_wire {
            if self.state() == ConnectionState::Ready {
                if let Some(gateway) = self.shared.current_gateway() {
                    let timeout = self.shared.command_timeout;
                    tokio::spawn(async move {
                        let payload = serde_json::to_string(&[kind.name()])
                            .unwrap_or_else(|_| "[]".into());
                        if let Err(e) = gateway.call(CommandKind::Subscribe, payload, timeout).await
                        {
                            error!(event = kind.name(), error = %e, "incremental subscribe failed");
                        }
                    });
                }
            }
        }
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.shared.router.unsubscribe(handle)
    }

    /// Register a click handler for this extension's status blocks.
    pub fn on_click(&self, handler: Arc<dyn ClickHandler>) {
        self.shared.clicks.register(&self.extension, handler);
    }
}

/// Builds a [`Hub`] from extension registrations
pub struct HubBuilder {
    extensions: Vec<(String, Value)>,
    subscriptions: Vec<(String, String, Arc<dyn EventHandler>)>,
    click_handlers: Vec<(String, Arc<dyn ClickHandler>)>,
    status: Option<(StatusOptions, StatusStreams)>,
    reconnect: ReconnectPolicy,
    command_timeout: Duration,
    drain_timeout: Duration,
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HubBuilder {
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
            subscriptions: Vec::new(),
            click_handlers: Vec::new(),
            status: None,
            reconnect: ReconnectPolicy::Off,
            command_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }

    /// Register an extension with its opaque configuration block.
    /// Registration order fixes the init delivery order and the status
    /// slot order.
    pub fn register(mut self, extension: &str, config: Value) -> Self {
        if let Some(existing) = self.extensions.iter_mut().find(|(e, _)| e == extension) {
            existing.1 = config;
        } else {
            self.extensions.push((extension.to_string(), config));
        }
        self
    }

    /// Attach a handler to an event name for an extension. An unknown
    /// extension is registered on the fly with an empty config.
    pub fn on(mut self, extension: &str, event: &str, handler: Arc<dyn EventHandler>) -> Self {
        if !self.extensions.iter().any(|(e, _)| e == extension) {
            self.extensions.push((extension.to_string(), Value::Null));
        }
        self.subscriptions
            .push((extension.to_string(), event.to_string(), handler));
        self
    }

    pub fn on_click(mut self, extension: &str, handler: Arc<dyn ClickHandler>) -> Self {
        if !self.extensions.iter().any(|(e, _)| e == extension) {
            self.extensions.push((extension.to_string(), Value::Null));
        }
        self.click_handlers.push((extension.to_string(), handler));
        self
    }

    /// Enable status-line output over the given streams.
    pub fn status_output(mut self, options: StatusOptions, streams: StatusStreams) -> Self {
        self.status = Some((options, streams));
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// How long `hub::shutdown` handlers get before forced termination
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> Hub {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = broadcast::channel(1);

        let router = Router::new();
        for (extension, event, handler) in self.subscriptions {
            router.subscribe(&event, &extension, handler);
        }
        let clicks = Arc::new(ClickRegistry::default());
        for (extension, handler) in self.click_handlers {
            clicks.register(&extension, handler);
        }

        let shared = Arc::new(ApiShared {
            router,
            gateway: Mutex::new(None),
            status: Mutex::new(None),
            clicks,
            state_rx,
            command_timeout: self.command_timeout,
            running_as_status: self.status.is_some(),
        });

        Hub {
            shared,
            configs: self.extensions,
            status_setup: Mutex::new(self.status),
            reconnect: self.reconnect,
            drain_timeout: self.drain_timeout,
            state_tx,
            shutdown_tx,
            ran: AtomicBool::new(false),
        }
    }
}

/// The assembled hub. `run` (in [`crate::lifecycle`]) drives it.
pub struct Hub {
    pub(crate) shared: Arc<ApiShared>,
    /// (extension, config) in registration order
    pub(crate) configs: Vec<(String, Value)>,
    /// Taken by the first session; status output survives reconnects
    pub(crate) status_setup: Mutex<Option<(StatusOptions, StatusStreams)>>,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) drain_timeout: Duration,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) ran: AtomicBool,
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    /// Watch the connection state machine.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_rx.clone()
    }

    /// Request a clean shutdown; `run` drains and returns `Ok(())`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// A `HubApi` scoped to an extension, for driving the hub from
    /// outside a handler.
    pub fn api(&self, extension: &str) -> HubApi {
        HubApi::scoped(self.shared.clone(), extension)
    }
}

/// Spawn one isolated task per matching subscription and return the set.
/// Panics and errors are caught at the task boundary and logged with the
/// extension id and event name; siblings are unaffected. The tasks stay
/// abortable, which drain relies on for forced termination.
pub(crate) fn start_dispatch(
    shared: &Arc<ApiShared>,
    event: &Event,
    only_extension: Option<&str>,
) -> JoinSet<()> {
    let mut set = JoinSet::new();
    for (extension, handler) in shared.router.snapshot(&event.name, only_extension) {
        let api = HubApi::scoped(shared.clone(), &extension);
        let event = event.clone();
        set.spawn(async move {
            let name = event.name.clone();
            let outcome = AssertUnwindSafe(handler.handle(api, event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let failure = HubError::Handler {
                        extension,
                        event: name.to_string(),
                        message: e.to_string(),
                    };
                    error!(error = %failure, "handler failed")
                }
                Err(_) => {
                    error!(extension = %extension, event = %name, "handler panicked")
                }
            }
        });
    }
    set
}

/// Fire-and-forget dispatch: handlers run concurrently, a detached reaper
/// collects their outcomes.
pub(crate) fn dispatch_event(shared: &Arc<ApiShared>, event: Event) {
    debug!(event = %event.name, "dispatching");
    let mut set = start_dispatch(shared, &event, None);
    if set.is_empty() {
        return;
    }
    tokio::spawn(async move { while set.join_next().await.is_some() {} });
}

/// Dispatch and wait for every matching handler to finish.
pub(crate) async fn dispatch_event_wait(
    shared: &Arc<ApiShared>,
    event: Event,
    only_extension: Option<&str>,
) {
    let mut set = start_dispatch(shared, &event, only_extension);
    while set.join_next().await.is_some() {}
}
