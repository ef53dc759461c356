//! Worker-side dispatch loops over the Fleetflow store queues.
//!
//! Two polling loops, one per queue: the flow processing loop leases
//! ready flow processing requests and runs them on a bounded task pool,
//! and the message loop leases handler inbox batches and feeds them to
//! registered handlers. Both follow the same contract: a request is
//! acknowledged (deleted) only after its handler returns `Ok`; on
//! failure it stays leased and comes back once the lease expires.
//!
//! Loops are spawned onto the current runtime and controlled through a
//! [`DispatcherHandle`], which drains in-flight work on shutdown.

use std::time::Duration;

use async_trait::async_trait;
use fleetflow_store::{FlowProcessingRequest, MessageHandlerRequest};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod flow_loop;
mod message_loop;

pub use flow_loop::{FlowDispatchOptions, FlowDispatcher};
pub use message_loop::{MessageDispatchOptions, MessageDispatcher};

/// Dispatch loop errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// In-flight work did not finish within the shutdown timeout. The
    /// affected requests stay leased and will be retried after expiry.
    #[error("{0} loop did not drain in-flight work in time")]
    ShutdownTimeout(&'static str),

    /// The loop task panicked or was cancelled.
    #[error("Dispatch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Store(#[from] fleetflow_store::StoreError),
}

/// Processes one leased flow processing request, typically by leasing
/// the flow itself and running its logic over the ready requests.
#[async_trait]
pub trait FlowProcessingHandler: Send + Sync + 'static {
    async fn handle(&self, request: FlowProcessingRequest) -> anyhow::Result<()>;
}

/// Processes a leased batch of inbox requests for one handler name.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, requests: Vec<MessageHandlerRequest>) -> anyhow::Result<()>;
}

/// Handle for controlling a running dispatch loop.
pub struct DispatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
    join_handle: JoinHandle<Result<(), DispatchError>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the loop to drain.
    pub async fn shutdown(self) -> Result<(), DispatchError> {
        let _ = self.shutdown_tx.send(()).await;
        self.join_handle.await?
    }
}

pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
