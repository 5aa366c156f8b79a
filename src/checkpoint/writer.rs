//! Background checkpoint persistence.
//!
//! The scheduler publishes checkpoints on a channel instead of writing them
//! inline; a dedicated task owns the store and acknowledges each write.
//! Publishing waits at most the configured timeout, covering both a full
//! queue and the acknowledgement.

use super::{Checkpoint, CheckpointId, CheckpointStore};
use crate::errors::{CheckpointError, PipelineError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const QUEUE_CAPACITY: usize = 32;

/// One queued write and the channel its result is sent back on.
pub struct CheckpointRequest {
    pub checkpoint: Checkpoint,
    pub ack: oneshot::Sender<Result<CheckpointId, CheckpointError>>,
}

pub struct CheckpointWriter {
    tx: mpsc::Sender<CheckpointRequest>,
    timeout: Duration,
    handle: JoinHandle<()>,
}

impl CheckpointWriter {
    /// Spawn the persistence task on the current runtime.
    pub fn spawn(store: Arc<CheckpointStore>, timeout: Duration) -> Self {
        Self::with_capacity(store, timeout, QUEUE_CAPACITY)
    }

    /// Like [`spawn`](Self::spawn) with `capacity` queued requests.
    pub fn with_capacity(store: Arc<CheckpointStore>, timeout: Duration, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CheckpointRequest>(capacity.max(1));
        let handle = tokio::spawn(async move {
            // Requests are handled one at a time so sequences follow publish order.
            while let Some(request) = rx.recv().await {
                let store = store.clone();
                let CheckpointRequest { checkpoint, ack } = request;
                let result = tokio::task::spawn_blocking(move || store.save(checkpoint))
                    .await
                    .unwrap_or_else(|e| {
                        Err(CheckpointError::Other(anyhow::anyhow!(
                            "checkpoint task panicked: {}",
                            e
                        )))
                    });
                if let Err(ref e) = result {
                    warn!(error = %e, "checkpoint write failed");
                }
                if ack.send(result).is_err() {
                    debug!("checkpoint acknowledgement dropped by publisher");
                }
            }
        });
        Self { tx, timeout, handle }
    }

    /// Queue a checkpoint and wait (bounded) for it to be persisted.
    pub async fn publish(&self, checkpoint: Checkpoint) -> Result<CheckpointId, PipelineError> {
        let story = checkpoint.story_id.clone();
        let (ack, rx) = oneshot::channel();
        let deadline = Instant::now() + self.timeout;
        match tokio::time::timeout_at(deadline, self.tx.send(CheckpointRequest { checkpoint, ack })).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(PipelineError::CheckpointUnavailable("checkpoint writer stopped".into()));
            }
            Err(_) => {
                return Err(PipelineError::CheckpointUnavailable(format!(
                    "checkpoint queue for {} still full after {}ms",
                    story,
                    self.timeout.as_millis()
                )));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Ok(id))) => Ok(id),
            Ok(Ok(Err(e))) => Err(PipelineError::CheckpointUnavailable(e.to_string())),
            Ok(Err(_)) => Err(PipelineError::CheckpointUnavailable(
                "checkpoint writer dropped the request".into(),
            )),
            Err(_) => Err(PipelineError::CheckpointUnavailable(format!(
                "checkpoint for {} not acknowledged within {}ms",
                story,
                self.timeout.as_millis()
            ))),
        }
    }

    /// Stop accepting requests and wait for queued writes to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "checkpoint writer task ended abnormally");
        }
    }
}
