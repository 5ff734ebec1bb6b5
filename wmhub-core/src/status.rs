//! Status Output Multiplexer
//!
//! One writer task owns the status output stream. It writes the capability
//! header before servicing any update, so extensions can never race a block
//! line ahead of the header. Updates are latest-wins per extension; the
//! writer drains the queue before rendering so bursts coalesce into a
//! single line. Every rendered line is a complete JSON array written with
//! one `write_all`, independently parseable downstream.
//!
//! Clicks arriving on the input stream are routed by matching their
//! `name`/`instance` echo against the blocks each extension last emitted;
//! only the owning extension's click handlers run.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use wmhub_protocol::{block_matches, content_blocks, ClickEvent, ClickFraming, StatusHeader};
use wmhub_utils::{HubError, Result};

use crate::connection::{BoxedReader, BoxedWriter};
use crate::extension::ClickHandler;
use crate::hub::HubApi;

/// Status-line behaviour knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOptions {
    /// How the click input stream is framed
    pub click_framing: ClickFraming,
    /// Signal the bar sends to pause output, advertised in the header
    pub stop_signal: Option<i32>,
    /// Signal the bar sends to resume output, advertised in the header
    pub cont_signal: Option<i32>,
}

/// The streams the status protocol runs over. In production this is
/// stdin/stdout; tests substitute in-memory pipes.
pub struct StatusStreams {
    pub output: BoxedWriter,
    pub input: Option<BoxedReader>,
}

impl StatusStreams {
    /// Speak the status protocol over this process's stdin/stdout.
    pub fn stdio() -> Self {
        Self {
            output: Box::new(tokio::io::stdout()),
            input: Some(Box::new(tokio::io::stdin())),
        }
    }

    /// Output only, no click events.
    pub fn write_only(output: BoxedWriter) -> Self {
        Self {
            output,
            input: None,
        }
    }
}

struct StatusSlot {
    extension: String,
    content: Option<Value>,
}

/// The current block set, one slot per extension in registration order.
/// A slot with no content is hidden but keeps its render position.
pub(crate) struct StatusState {
    slots: Vec<StatusSlot>,
}

impl StatusState {
    pub(crate) fn new(extensions: impl IntoIterator<Item = String>) -> Self {
        Self {
            slots: extensions
                .into_iter()
                .map(|extension| StatusSlot {
                    extension,
                    content: None,
                })
                .collect(),
        }
    }

    fn apply(&mut self, extension: &str, content: Option<Value>) -> bool {
        match self.slots.iter_mut().find(|s| s.extension == extension) {
            Some(slot) => {
                slot.content = content;
                true
            }
            None => false,
        }
    }

    /// Flatten the visible slots into the rendered block list.
    fn render_blocks(&self) -> Vec<Value> {
        self.slots
            .iter()
            .filter_map(|s| s.content.as_ref())
            .flat_map(content_blocks)
            .cloned()
            .collect()
    }

    fn owner_of_click(&self, click: &ClickEvent) -> Option<String> {
        self.slots
            .iter()
            .filter_map(|s| s.content.as_ref().map(|c| (&s.extension, c)))
            .find(|(_, content)| {
                content_blocks(content).any(|block| {
                    block_matches(block, click.name.as_deref(), click.instance.as_deref())
                })
            })
            .map(|(extension, _)| extension.clone())
    }
}

enum StatusMsg {
    Render,
    Suspend,
    Resume,
    Close(oneshot::Sender<()>),
}

/// Handle to the status writer task
#[derive(Clone)]
pub(crate) struct StatusOutput {
    tx: mpsc::Sender<StatusMsg>,
    state: Arc<Mutex<StatusState>>,
}

impl StatusOutput {
    /// Spawn the writer task. The header goes out before any queued update
    /// is serviced.
    pub(crate) fn spawn(
        writer: BoxedWriter,
        options: &StatusOptions,
        click_events: bool,
        state: Arc<Mutex<StatusState>>,
    ) -> StatusOutput {
        let (tx, rx) = mpsc::channel(8);
        let header = StatusHeader {
            stop_signal: options.stop_signal,
            cont_signal: options.cont_signal,
            ..StatusHeader::new(click_events)
        };
        tokio::spawn(run_writer(writer, header, rx, state.clone()));
        StatusOutput { tx, state }
    }

    /// Replace an extension's block content and schedule a render.
    /// `None` hides the block but keeps its slot.
    pub(crate) fn update(&self, extension: &str, content: Option<Value>) -> Result<()> {
        let applied = self
            .state
            .lock()
            .expect("status state lock poisoned")
            .apply(extension, content);
        if !applied {
            return Err(HubError::internal(format!(
                "no status slot for extension {:?}",
                extension
            )));
        }
        self.schedule_render()
    }

    /// Schedule a render of the current block set.
    pub(crate) fn refresh(&self) -> Result<()> {
        self.schedule_render()
    }

    fn schedule_render(&self) -> Result<()> {
        match self.tx.try_send(StatusMsg::Render) {
            // A full queue already holds a render that will pick this
            // state up
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::ShuttingDown),
        }
    }

    pub(crate) async fn suspend(&self) {
        let _ = self.tx.send(StatusMsg::Suspend).await;
    }

    pub(crate) async fn resume(&self) {
        let _ = self.tx.send(StatusMsg::Resume).await;
    }

    pub(crate) fn owner_of_click(&self, click: &ClickEvent) -> Option<String> {
        self.state
            .lock()
            .expect("status state lock poisoned")
            .owner_of_click(click)
    }

    /// Stop the writer after it has flushed everything queued so far.
    pub(crate) async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(StatusMsg::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_writer(
    mut writer: BoxedWriter,
    header: StatusHeader,
    mut rx: mpsc::Receiver<StatusMsg>,
    state: Arc<Mutex<StatusState>>,
) {
    let header_line = match serde_json::to_string(&header) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "failed to serialize status header");
            return;
        }
    };
    if write_line(&mut writer, header_line).await.is_err() {
        return;
    }

    let mut suspended = false;
    let mut carried: Option<StatusMsg> = None;
    loop {
        let msg = match carried.take() {
            Some(msg) => msg,
            None => match rx.recv().await {
                Some(msg) => msg,
                None => return,
            },
        };
        match msg {
            StatusMsg::Render => {
                // Coalesce the burst: drain queued renders, keep the first
                // non-render message for the next iteration
                while let Ok(next) = rx.try_recv() {
                    if !matches!(next, StatusMsg::Render) {
                        carried = Some(next);
                        break;
                    }
                }
                if !suspended && render(&mut writer, &state).await.is_err() {
                    return;
                }
            }
            StatusMsg::Suspend => suspended = true,
            StatusMsg::Resume => {
                if suspended {
                    suspended = false;
                    if render(&mut writer, &state).await.is_err() {
                        return;
                    }
                }
            }
            StatusMsg::Close(ack) => {
                let _ = ack.send(());
                return;
            }
        }
    }
}

async fn render(writer: &mut BoxedWriter, state: &Arc<Mutex<StatusState>>) -> Result<()> {
    let blocks = state
        .lock()
        .expect("status state lock poisoned")
        .render_blocks();
    let line = serde_json::to_string(&Value::Array(blocks)).map_err(|e| {
        error!(error = %e, "failed to serialize status line");
        HubError::internal(e.to_string())
    })?;
    write_line(writer, line).await
}

/// Write a newline-terminated line with a single `write_all`.
async fn write_line(writer: &mut BoxedWriter, mut line: String) -> Result<()> {
    line.push('\n');
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        error!(error = %e, "status output write failed, stopping writer");
        return Err(e.into());
    }
    writer.flush().await.map_err(|e| {
        error!(error = %e, "status output flush failed, stopping writer");
        HubError::from(e)
    })
}

/// Click handlers, grouped per extension
#[derive(Default)]
pub(crate) struct ClickRegistry {
    handlers: Mutex<Vec<(String, Arc<dyn ClickHandler>)>>,
}

impl ClickRegistry {
    pub(crate) fn register(&self, extension: &str, handler: Arc<dyn ClickHandler>) {
        self.handlers
            .lock()
            .expect("click registry lock poisoned")
            .push((extension.to_string(), handler));
    }

    fn snapshot(&self, extension: &str) -> Vec<Arc<dyn ClickHandler>> {
        self.handlers
            .lock()
            .expect("click registry lock poisoned")
            .iter()
            .filter(|(e, _)| e == extension)
            .map(|(_, h)| h.clone())
            .collect()
    }
}

/// Spawn the click reader task: parse stdin lines, find the extension that
/// owns the clicked block, run that extension's click handlers. Unroutable
/// clicks are logged and dropped.
pub(crate) fn spawn_click_reader<F>(
    input: BoxedReader,
    framing: ClickFraming,
    output: StatusOutput,
    clicks: Arc<ClickRegistry>,
    api_for: F,
) where
    F: Fn(&str) -> HubApi + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("status input closed");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "error reading status input");
                    return;
                }
            };
            let click = match ClickEvent::parse_line(&line, framing) {
                Ok(Some(click)) => click,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "ignoring unparseable click line");
                    continue;
                }
            };
            let Some(owner) = output.owner_of_click(&click) else {
                debug!(
                    name = ?click.name,
                    instance = ?click.instance,
                    "click matches no visible status block"
                );
                continue;
            };
            for handler in clicks.snapshot(&owner) {
                let api = api_for(&owner);
                let click = click.clone();
                let owner = owner.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(api, click).await {
                        error!(extension = %owner, error = %e, "click handler failed");
                    }
                });
            }
        }
    });
}
