//! Lifecycle Controller
//!
//! Drives the connection state machine: Disconnected → Connecting → Ready
//! → Draining → Closed, with the back-edge Ready → Connecting on loss when
//! reconnection is enabled. Only this module mutates the state watch;
//! everything else observes it.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use wmhub_protocol::{CommandKind, EventKind};
use wmhub_utils::{HubError, Result};

use crate::connection::{spawn_connection, BoxedReader, BoxedWriter, Connect, Inbound};
use crate::extension::{events, Event};
use crate::gateway::CommandGateway;
use crate::hub::{dispatch_event, dispatch_event_wait, start_dispatch, ApiShared, Hub, HubApi};
use crate::status::{spawn_click_reader, StatusOptions, StatusOutput, StatusState};

/// Connection state machine, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Whether and how to re-establish a lost connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// A lost connection ends the run
    Off,
    /// Bounded attempts with a fixed delay between them
    Fixed { max_attempts: u32, delay: Duration },
}

enum SessionEnd {
    /// Drained; run returns Ok
    Clean,
    /// Connection went away mid-session
    Lost(HubError),
}

impl Hub {
    /// Drive the hub until clean shutdown or unrecoverable connection
    /// failure. Runs at most once per hub.
    pub async fn run(&self, connector: impl Connect) -> Result<()> {
        if self.ran.swap(true, Ordering::SeqCst) {
            return Err(HubError::internal("hub was already run"));
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut first_session = true;

        let result = loop {
            self.set_state(ConnectionState::Connecting);
            let halves = match self.connect_with_retry(&connector, &mut shutdown_rx).await {
                Ok(Some(halves)) => halves,
                Ok(None) => break Ok(()),
                Err(e) => {
                    // Extensions that saw init get their shutdown drain
                    // even when the reconnect attempts ran out
                    if !first_session {
                        self.drain(Value::Null).await;
                    }
                    break Err(e);
                }
            };
            match self
                .session(halves, first_session, &mut shutdown_rx)
                .await
            {
                SessionEnd::Clean => break Ok(()),
                SessionEnd::Lost(err) => {
                    warn!(error = %err, "connection lost");
                    self.clear_gateway();
                    if matches!(self.reconnect, ReconnectPolicy::Off) || !err.is_retryable() {
                        self.drain(Value::Null).await;
                        break Err(err);
                    }
                    first_session = false;
                }
            }
        };
        self.set_state(ConnectionState::Closed);
        result
    }

    /// Connect, retrying per the reconnect policy. `Ok(None)` means a
    /// shutdown request arrived while waiting between attempts.
    async fn connect_with_retry(
        &self,
        connector: &impl Connect,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Option<(BoxedReader, BoxedWriter)>> {
        let (max_attempts, delay) = match self.reconnect {
            ReconnectPolicy::Off => (0, Duration::ZERO),
            ReconnectPolicy::Fixed {
                max_attempts,
                delay,
            } => (max_attempts, delay),
        };
        let mut attempt: u32 = 0;
        loop {
            match connector.connect().await {
                Ok(halves) => return Ok(Some(halves)),
                Err(e) if attempt < max_attempts => {
                    attempt += 1;
                    warn!(attempt, max_attempts, error = %e, "connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One connected session: subscribe, start status output (first
    /// session only), fire init, then pump events until shutdown or loss.
    async fn session(
        &self,
        (reader, writer): (BoxedReader, BoxedWriter),
        first_session: bool,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let parts = spawn_connection(reader, writer);
        let mut events_rx = parts.events;
        let gateway = CommandGateway::spawn(parts.handle, parts.replies);
        *self
            .shared
            .gateway
            .lock()
            .expect("gateway lock poisoned") = Some(gateway.clone());

        // Subscribe to the union of protocol events the router references
        let names: Vec<&str> = self
            .shared
            .router
            .protocol_events()
            .iter()
            .map(|k| k.name())
            .collect();
        let payload = match serde_json::to_string(&names) {
            Ok(payload) => payload,
            Err(e) => return SessionEnd::Lost(HubError::internal(e.to_string())),
        };
        debug!(events = ?names, "subscribing to protocol events");
        if let Err(e) = gateway
            .call(CommandKind::Subscribe, payload, self.shared.command_timeout)
            .await
        {
            return SessionEnd::Lost(e);
        }

        if first_session {
            self.start_status_output();
        }

        self.set_state(ConnectionState::Ready);
        info!("connected to window manager");

        if first_session {
            // Init is delivered per extension in registration order,
            // awaited so no protocol event outruns it
            for (extension, config) in &self.configs {
                let body = json!({
                    "config": config,
                    "running_as_status": self.shared.running_as_status,
                });
                dispatch_event_wait(
                    &self.shared,
                    Event::new(events::INIT, body),
                    Some(extension),
                )
                .await;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.drain(Value::Null).await;
                    return SessionEnd::Clean;
                }
                inbound = events_rx.recv() => match inbound {
                    Some(Inbound::Event(EventKind::Shutdown, body)) => {
                        info!("window manager announced shutdown");
                        dispatch_event(&self.shared, Event::new(EventKind::Shutdown.name(), body.clone()));
                        self.drain(body).await;
                        return SessionEnd::Clean;
                    }
                    Some(Inbound::Event(kind, body)) => {
                        dispatch_event(&self.shared, Event::new(kind.name(), body));
                    }
                    Some(Inbound::Closed(err)) => return SessionEnd::Lost(err),
                    None => return SessionEnd::Lost(HubError::ConnectionLost),
                }
            }
        }
    }

    /// Start the status writer, click reader and suspend/resume signal
    /// listeners. Runs once; status output survives reconnects.
    fn start_status_output(&self) {
        let Some((options, streams)) = self
            .status_setup
            .lock()
            .expect("status setup lock poisoned")
            .take()
        else {
            return;
        };
        let state = Arc::new(Mutex::new(StatusState::new(
            self.configs.iter().map(|(e, _)| e.clone()),
        )));
        let click_events = streams.input.is_some();
        let output = StatusOutput::spawn(streams.output, &options, click_events, state);
        *self
            .shared
            .status
            .lock()
            .expect("status lock poisoned") = Some(output.clone());

        if let Some(input) = streams.input {
            let shared = self.shared.clone();
            spawn_click_reader(
                input,
                options.click_framing,
                output.clone(),
                self.shared.clicks.clone(),
                move |extension| HubApi::scoped(shared.clone(), extension),
            );
        }
        spawn_status_signals(&options, output, self.shared.clone());
    }

    /// Stop external dispatch, run `hub::shutdown` handlers with a bounded
    /// timeout, then close status output and refuse further commands.
    async fn drain(&self, body: Value) {
        if *self.shared.state_rx.borrow() == ConnectionState::Draining {
            return;
        }
        self.set_state(ConnectionState::Draining);
        info!("draining");

        let mut set = start_dispatch(&self.shared, &Event::new(events::SHUTDOWN, body), None);
        if !set.is_empty() {
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "shutdown handlers exceeded the drain timeout, aborting"
                );
                set.abort_all();
                while set.join_next().await.is_some() {}
            }
        }

        let status = self
            .shared
            .status
            .lock()
            .expect("status lock poisoned")
            .take();
        if let Some(status) = status {
            status.close().await;
        }
        self.clear_gateway();
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(%state, "connection state");
        self.state_tx.send_replace(state);
    }

    fn clear_gateway(&self) {
        *self
            .shared
            .gateway
            .lock()
            .expect("gateway lock poisoned") = None;
    }
}

/// Listen for the stop/cont signals advertised in the status header and
/// pause or resume output, notifying extensions either way.
fn spawn_status_signals(options: &StatusOptions, output: StatusOutput, shared: Arc<ApiShared>) {
    use tokio::signal::unix::{signal, SignalKind};

    if let Some(sig) = options.stop_signal {
        match signal(SignalKind::from_raw(sig)) {
            Ok(mut stream) => {
                let output = output.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        dispatch_event(
                            &shared,
                            Event::new(events::STATUS_SUSPEND, Value::Null),
                        );
                        output.suspend().await;
                    }
                });
            }
            Err(e) => warn!(signal = sig, error = %e, "cannot listen for stop signal"),
        }
    }
    if let Some(sig) = options.cont_signal {
        match signal(SignalKind::from_raw(sig)) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        output.resume().await;
                        dispatch_event(
                            &shared,
                            Event::new(events::STATUS_RESUME, Value::Null),
                        );
                    }
                });
            }
            Err(e) => warn!(signal = sig, error = %e, "cannot listen for cont signal"),
        }
    }
}
