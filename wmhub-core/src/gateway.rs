//! Command Gateway
//!
//! Serializes concurrent command calls onto the Connection Multiplexer and
//! matches replies back to callers.
//!
//! Design constraint: the control protocol carries no sequence numbers on
//! the wire, so replies can only be correlated by arrival order. The
//! gateway therefore keeps exactly one command in flight per connection:
//! the next queued command is not written until the previous reply has been
//! consumed. Callers still interleave freely; they suspend on their own
//! result slot. Internally every pending command is tagged with a
//! monotonically increasing sequence number so that a caller that timed out
//! has its late reply consumed and silently discarded without shifting
//! correlation for the next caller.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use wmhub_protocol::{CommandKind, OutFrame};
use wmhub_utils::{HubError, Result};

use crate::connection::ConnectionHandle;

struct CommandRequest {
    kind: CommandKind,
    payload: String,
    slot: oneshot::Sender<Result<Value>>,
}

/// One in-flight command
struct PendingCommand {
    seq: u32,
    kind: CommandKind,
    issued_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

/// Cloneable handle for issuing commands
#[derive(Clone)]
pub struct CommandGateway {
    tx: mpsc::Sender<CommandRequest>,
}

impl CommandGateway {
    /// Spawn the gateway task for a freshly opened connection.
    pub(crate) fn spawn(
        conn: ConnectionHandle,
        replies: mpsc::Receiver<(u32, Value)>,
    ) -> CommandGateway {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_gateway(rx, conn, replies));
        CommandGateway { tx }
    }

    /// Issue a command and suspend until its reply, a timeout, or
    /// connection loss.
    ///
    /// On timeout the caller gets `Timeout` and the connection stays open;
    /// the reply, when it eventually arrives, is discarded by the gateway
    /// task.
    pub async fn call(
        &self,
        kind: CommandKind,
        payload: String,
        timeout: Duration,
    ) -> Result<Value> {
        let (slot, rx) = oneshot::channel();
        self.tx
            .send(CommandRequest {
                kind,
                payload,
                slot,
            })
            .await
            .map_err(|_| HubError::ConnectionLost)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HubError::ConnectionLost),
            Err(_) => Err(HubError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        }
    }
}

async fn run_gateway(
    mut requests: mpsc::Receiver<CommandRequest>,
    conn: ConnectionHandle,
    mut replies: mpsc::Receiver<(u32, Value)>,
) {
    let mut seq: u32 = 0;
    loop {
        tokio::select! {
            req = requests.recv() => {
                let Some(req) = req else {
                    // Every gateway handle dropped; nothing more to do
                    return;
                };
                seq = seq.wrapping_add(1);
                let pending = PendingCommand {
                    seq,
                    kind: req.kind,
                    issued_at: Instant::now(),
                    slot: req.slot,
                };
                debug!(seq, kind = req.kind.name(), "sending command");
                if conn
                    .send(OutFrame::new(req.kind, req.payload))
                    .await
                    .is_err()
                {
                    let _ = pending.slot.send(Err(HubError::ConnectionLost));
                    fail_queued(&mut requests);
                    return;
                }
                // Single in-flight: consume this command's reply before
                // admitting the next request
                match replies.recv().await {
                    Some((code, body)) => resolve(pending, code, body),
                    None => {
                        let _ = pending.slot.send(Err(HubError::ConnectionLost));
                        fail_queued(&mut requests);
                        return;
                    }
                }
            }
            reply = replies.recv() => {
                match reply {
                    Some((code, _)) => warn!(code, "unsolicited reply with no command in flight"),
                    None => {
                        fail_queued(&mut requests);
                        return;
                    }
                }
            }
        }
    }
}

fn resolve(pending: PendingCommand, code: u32, body: Value) {
    if code != pending.kind.code() {
        warn!(
            seq = pending.seq,
            expected = pending.kind.code(),
            got = code,
            "reply type tag does not match the command in flight"
        );
    }
    let elapsed = pending.issued_at.elapsed();
    if pending.slot.send(Ok(body)).is_err() {
        // Caller timed out and went away; correlation stays intact
        debug!(seq = pending.seq, ?elapsed, "discarding late reply");
    }
}

/// Fail every request still queued behind a lost connection, exactly once
/// each.
fn fail_queued(requests: &mut mpsc::Receiver<CommandRequest>) {
    requests.close();
    while let Ok(req) = requests.try_recv() {
        let _ = req.slot.send(Err(HubError::ConnectionLost));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::spawn_connection;
    use bytes::BytesMut;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::FramedRead;
    use wmhub_protocol::codec::encode_raw;
    use wmhub_protocol::{IpcCodec, RawMessage};

    /// Mock window manager: replies to each command frame with
    /// `{"seen": <payload text>}` in arrival order. Parses headers by hand
    /// because command payloads are not always JSON.
    fn spawn_echo_wm(stream: tokio::io::DuplexStream) {
        tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(stream);
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 1024];
            loop {
                while buf.len() >= 14 {
                    let len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
                    if buf.len() < 14 + len {
                        break;
                    }
                    let code = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
                    let payload = String::from_utf8_lossy(&buf[14..14 + len]).to_string();
                    bytes::Buf::advance(&mut buf, 14 + len);
                    let mut out = BytesMut::new();
                    encode_raw(code, &json!({ "seen": payload }), &mut out);
                    if write.write_all(&out).await.is_err() {
                        return;
                    }
                }
                match read.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
        });
    }

    fn gateway_over_duplex() -> (CommandGateway, tokio::io::DuplexStream) {
        let (hub_side, wm_side) = duplex(4096);
        let (r, w) = tokio::io::split(hub_side);
        let parts = spawn_connection(Box::new(r), Box::new(w));
        let gateway = CommandGateway::spawn(parts.handle, parts.replies);
        (gateway, wm_side)
    }

    #[tokio::test]
    async fn test_call_receives_reply() {
        let (gateway, wm_side) = gateway_over_duplex();
        spawn_echo_wm(wm_side);

        let reply = gateway
            .call(
                CommandKind::RunCommand,
                "focus left".into(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"seen": "focus left"}));
    }

    #[tokio::test]
    async fn test_concurrent_callers_each_get_their_own_reply() {
        let (gateway, wm_side) = gateway_over_duplex();
        spawn_echo_wm(wm_side);

        let mut joins = Vec::new();
        for i in 0..16 {
            let gateway = gateway.clone();
            joins.push(tokio::spawn(async move {
                let payload = format!("caller-{}", i);
                let reply = gateway
                    .call(CommandKind::SendTick, payload, Duration::from_secs(5))
                    .await
                    .unwrap();
                (i, reply)
            }));
        }
        for j in joins {
            let (i, reply) = j.await.unwrap();
            assert_eq!(reply, json!({"seen": format!("caller-{}", i)}));
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_connection_usable() {
        let (gateway, wm_side) = gateway_over_duplex();
        let (read, mut write) = tokio::io::split(wm_side);
        let mut framed = FramedRead::new(read, IpcCodec::new());

        // First command: let it time out, then answer late
        let err = gateway
            .call(
                CommandKind::GetTree,
                String::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout { ms: 50 }));

        // The command did reach the wire
        let first = framed.next().await.unwrap().unwrap();
        assert!(matches!(first, RawMessage::Reply { code: 4, .. }));

        // Late reply for the abandoned command, then start answering
        // normally: the late reply must be discarded, not given to the
        // next caller
        let mut buf = BytesMut::new();
        encode_raw(CommandKind::GetTree.code(), &json!({"stale": true}), &mut buf);
        write.write_all(&buf).await.unwrap();

        let next = tokio::spawn({
            let gateway = gateway.clone();
            async move {
                gateway
                    .call(CommandKind::GetMarks, String::new(), Duration::from_secs(5))
                    .await
            }
        });

        // Consume the second command and answer it
        let second = framed.next().await.unwrap().unwrap();
        assert!(matches!(second, RawMessage::Reply { code: 5, .. }));
        let mut buf = BytesMut::new();
        encode_raw(CommandKind::GetMarks.code(), &json!(["mark-a"]), &mut buf);
        write.write_all(&buf).await.unwrap();

        assert_eq!(next.await.unwrap().unwrap(), json!(["mark-a"]));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_all_pending_exactly_once() {
        let (gateway, wm_side) = gateway_over_duplex();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let gateway = gateway.clone();
            joins.push(tokio::spawn(async move {
                gateway
                    .call(CommandKind::GetVersion, String::new(), Duration::from_secs(5))
                    .await
            }));
        }
        // Give the callers time to enqueue, then sever the connection
        tokio::task::yield_now().await;
        drop(wm_side);

        for j in joins {
            let result = j.await.unwrap();
            assert!(matches!(result, Err(HubError::ConnectionLost)));
        }

        // Calls after the loss fail the same way
        let err = gateway
            .call(CommandKind::GetVersion, String::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ConnectionLost));
    }
}
