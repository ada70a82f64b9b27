//! Realtime fan-out.
//!
//! Two channels per run: best-effort stream frames over a broadcast
//! channel (NDJSON writers attach with a bounded queue and a write
//! deadline, and are dropped on backpressure), and the authoritative
//! persisted run-event log written through the transcript store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use strand_domain::config::StreamConfig;
use strand_domain::message::Block;
use strand_domain::stream::Usage;
use strand_domain::thread::RunState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Best-effort frames pushed to live subscribers. Authoritative state is
/// the persisted run-event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    RunStatus {
        run_id: Uuid,
        status: RunState,
    },
    AssistantDelta {
        run_id: Uuid,
        message_id: String,
        text: String,
    },
    /// A block changed at a fixed index of the assistant message. The
    /// next persisted message snapshot must show the same block at the
    /// same index with the same status.
    BlockSet {
        run_id: Uuid,
        message_id: String,
        index: usize,
        block: Block,
    },
    ToolApproval {
        run_id: Uuid,
        tool_id: String,
        tool_name: String,
    },
    Lifecycle {
        run_id: Uuid,
        event_type: String,
        payload: serde_json::Value,
    },
    RunEnd {
        run_id: Uuid,
        status: RunState,
        usage: Usage,
        estimated_cost_usd: f64,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-run broadcast channels for live subscribers.
#[derive(Default)]
pub struct EventHub {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<StreamFrame>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<StreamFrame> {
        let mut channels = self.channels.write();
        channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// Emit a frame. Best effort: no subscribers, no delivery.
    pub fn emit(&self, run_id: Uuid, frame: StreamFrame) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(&run_id) {
            let _ = tx.send(frame);
        }
    }

    pub fn cleanup(&self, run_id: Uuid) {
        self.channels.write().remove(&run_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NDJSON writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Attach an NDJSON writer to a run's frame stream.
///
/// Frames pass through a bounded queue; a slow or stalled client drops
/// itself (queue overflow or write deadline) without ever blocking the
/// run. Returns when the subscriber drops, the writer fails, or the hub
/// channel closes.
pub async fn pump_ndjson<W>(
    mut frames: broadcast::Receiver<StreamFrame>,
    writer: W,
    cfg: &StreamConfig,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<StreamFrame>(cfg.writer_queue.max(1));
    let deadline = std::time::Duration::from_millis(cfg.write_deadline_ms.max(1));

    // Forwarder: broadcast → bounded queue. try_send, never await: the
    // run must not block on a slow client.
    let forwarder = tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    if tx.try_send(frame).is_err() {
                        tracing::debug!("ndjson subscriber queue full, dropping client");
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "ndjson subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let mut writer = writer;
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize stream frame");
                continue;
            }
        };
        line.push(b'\n');
        match tokio::time::timeout(deadline, writer.write_all(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "ndjson write failed, dropping client");
                break;
            }
            Err(_) => {
                tracing::debug!("ndjson write deadline exceeded, dropping client");
                break;
            }
        }
    }

    forwarder.abort();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_subscribers_in_order() {
        let hub = EventHub::new();
        let run_id = Uuid::new_v4();
        let mut rx = hub.subscribe(run_id);

        for status in [RunState::Accepted, RunState::Running, RunState::Success] {
            hub.emit(run_id, StreamFrame::RunStatus { run_id, status });
        }

        for expected in [RunState::Accepted, RunState::Running, RunState::Success] {
            match rx.recv().await.unwrap() {
                StreamFrame::RunStatus { status, .. } => assert_eq!(status, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_best_effort() {
        let hub = EventHub::new();
        // No subscribe() happened; emit must not panic or block.
        hub.emit(
            Uuid::new_v4(),
            StreamFrame::RunStatus {
                run_id: Uuid::new_v4(),
                status: RunState::Running,
            },
        );
    }

    #[tokio::test]
    async fn ndjson_pump_writes_lines() {
        let hub = EventHub::new();
        let run_id = Uuid::new_v4();
        let rx = hub.subscribe(run_id);
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let cfg = StreamConfig::default();
        let pump = tokio::spawn(async move { pump_ndjson(rx, client, &cfg).await });

        hub.emit(run_id, StreamFrame::RunStatus { run_id, status: RunState::Running });
        hub.cleanup(run_id);
        drop(hub);

        pump.await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        let line: serde_json::Value = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(line["type"], "run_status");
        assert_eq!(line["status"], "running");
    }

    #[tokio::test]
    async fn stalled_client_is_dropped_without_blocking_emitters() {
        let hub = EventHub::new();
        let run_id = Uuid::new_v4();
        let rx = hub.subscribe(run_id);

        // A tiny duplex that fills instantly and is never read.
        let (client, _server) = tokio::io::duplex(16);
        let cfg = StreamConfig {
            writer_queue: 4,
            write_deadline_ms: 50,
        };
        let pump = tokio::spawn(async move { pump_ndjson(rx, client, &cfg).await });

        // Flood. Emitters never block regardless of the dead client.
        for _ in 0..500 {
            hub.emit(run_id, StreamFrame::RunStatus { run_id, status: RunState::Running });
        }

        tokio::time::timeout(std::time::Duration::from_secs(2), pump)
            .await
            .expect("pump exits after dropping the stalled client")
            .unwrap();
    }
}
