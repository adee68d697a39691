//! JSON-lines transport for the operation surface
//!
//! Each input line is an operation request:
//!
//! ```text
//! {"requestId": 1, "op": "db:connect", "args": {"type": "mysql", ...}}
//! ```
//!
//! and produces exactly one response line carrying the same `requestId`.
//! Requests run concurrently, so responses may arrive out of order. Registry
//! changes are pushed as `{"event": {"type": "added", "id": ...}}` lines.

use dbdeck_core::ops::{handle_request, OperationRequest};
use dbdeck_core::registry::RegistryEvent;
use dbdeck_core::ConnectionManager;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Output lines buffered before request tasks wait on the writer
const OUTPUT_BUFFER: usize = 1024;

/// Transport options
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// How often idle pooled connections are reaped
    pub reap_interval: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Serve requests from `input` until EOF or `shutdown`, then close every
/// connection. Returns the output sink once everything has been written.
pub async fn serve<R, W>(
    manager: Arc<ConnectionManager>,
    input: R,
    mut output: W,
    options: ServeOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<serde_json::Value>(OUTPUT_BUFFER);

    let writer = async {
        while let Some(line) = rx.recv().await {
            let mut bytes = serde_json::to_vec(&line)?;
            bytes.push(b'\n');
            output.write_all(&bytes).await?;
            output.flush().await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let reader = read_requests(manager, input, tx, options, shutdown);

    let (read_result, write_result) = tokio::join!(reader, writer);
    read_result?;
    write_result?;
    Ok(output)
}

async fn read_requests<R>(
    manager: Arc<ConnectionManager>,
    input: R,
    tx: mpsc::Sender<serde_json::Value>,
    options: ServeOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut events = manager.subscribe();
    let mut in_flight = JoinSet::new();
    let mut reap = tokio::time::interval(options.reap_interval);
    reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Serving operations on stdin");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Input closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<OperationRequest>(line) {
                    Ok(request) => {
                        let manager = manager.clone();
                        let tx = tx.clone();
                        let cancel = shutdown.child_token();
                        in_flight.spawn(async move {
                            let response = handle_request(&manager, request, &cancel).await;
                            let _ = tx.send(json!(response)).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Malformed request");
                        let _ = tx
                            .send(json!({
                                "result": {"success": false, "message": format!("Invalid request: {}", e)}
                            }))
                            .await;
                    }
                }
            }
            event = events.recv() => forward_event(event, &tx).await,
            _ = reap.tick() => {
                let reaped = manager.reap_idle().await;
                if reaped > 0 {
                    debug!(reaped, "Closed idle connections");
                }
            }
            // finished request tasks are collected as we go
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Request task failed");
                }
            }
        }
    }

    // Let in-flight requests answer; on shutdown their tokens are already cancelled
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Request task failed");
        }
    }

    manager.shutdown().await;

    loop {
        match events.try_recv() {
            Ok(event) => forward_event(Ok(event), &tx).await,
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Dropped registry events");
            }
            Err(_) => break,
        }
    }

    info!("Operation transport stopped");
    Ok(())
}

async fn forward_event(
    event: Result<RegistryEvent, broadcast::error::RecvError>,
    tx: &mpsc::Sender<serde_json::Value>,
) {
    match event {
        Ok(event) => {
            let _ = tx.send(json!({ "event": event })).await;
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Dropped registry events");
        }
        // the manager outlives this loop
        Err(broadcast::error::RecvError::Closed) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(input: &str) -> Vec<serde_json::Value> {
        let manager = Arc::new(ConnectionManager::default());
        let output = serve(
            manager,
            input.as_bytes(),
            Vec::new(),
            ServeOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_response_per_request() {
        let responses = run(concat!(
            "{\"requestId\": 1, \"op\": \"db:list-connections\"}\n",
            "\n",
            "{\"requestId\": 2, \"op\": \"db:disconnect\", \"args\": \"conn_1\"}\n",
        ))
        .await;

        assert_eq!(responses.len(), 2);
        let by_id = |id: i64| {
            responses
                .iter()
                .find(|r| r["requestId"] == id)
                .cloned()
                .unwrap()
        };
        assert_eq!(by_id(1)["result"], json!([]));
        assert_eq!(by_id(2)["result"], json!(false));
        assert_eq!(by_id(2)["op"], "db:disconnect");
    }

    #[tokio::test]
    async fn test_failures_are_responses() {
        let responses = run(concat!(
            "not json\n",
            "{\"requestId\": \"a\", \"op\": \"db:connect\", \"args\": {\"type\": \"unknown\"}}\n",
        ))
        .await;

        assert_eq!(responses.len(), 2);
        let malformed = responses.iter().find(|r| r.get("requestId").is_none()).unwrap();
        assert_eq!(malformed["result"]["success"], false);
        assert!(malformed["result"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request"));

        let connect = responses.iter().find(|r| r["requestId"] == "a").unwrap();
        assert_eq!(connect["result"]["success"], false);
        assert!(connect["result"]["message"]
            .as_str()
            .unwrap()
            .contains("Unsupported"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_reading() {
        let manager = Arc::new(ConnectionManager::default());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // stdin-like input that never ends
        let (_client, server) = tokio::io::duplex(64);
        let output = serve(
            manager,
            tokio::io::BufReader::new(server),
            Vec::new(),
            ServeOptions::default(),
            shutdown,
        )
        .await
        .unwrap();
        assert!(output.is_empty());
    }
}
