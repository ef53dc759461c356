//! Flow processing dispatch loop.
//!
//! Polls the FPR queue, leases up to as many requests as there are idle
//! workers, and runs each on its own task. Successful requests are
//! acked; failed ones are left leased so the queue retries them after
//! the lease window.

use std::sync::Arc;
use std::time::Duration;

use fleetflow_store::FlowStore;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::{DispatchError, DispatcherHandle, FlowProcessingHandler, DEFAULT_SHUTDOWN_TIMEOUT};

/// Maximum concurrent flow processing tasks per loop.
const DEFAULT_WORKER_COUNT: usize = 4;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Tuning knobs for [`FlowDispatcher`].
#[derive(Debug, Clone)]
pub struct FlowDispatchOptions {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for FlowDispatchOptions {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Polling loop feeding leased FPRs to a [`FlowProcessingHandler`].
pub struct FlowDispatcher {
    store: FlowStore,
    handler: Arc<dyn FlowProcessingHandler>,
    options: FlowDispatchOptions,
    pool: Arc<Semaphore>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl FlowDispatcher {
    /// Spawn the loop onto the current runtime.
    pub fn spawn(
        store: FlowStore,
        handler: Arc<dyn FlowProcessingHandler>,
        options: FlowDispatchOptions,
    ) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let pool = Arc::new(Semaphore::new(options.worker_count));
        let dispatcher = Self {
            store,
            handler,
            options,
            pool,
            shutdown_rx,
        };
        let join_handle = tokio::spawn(dispatcher.run());
        DispatcherHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn run(mut self) -> Result<(), DispatchError> {
        info!(
            worker_count = self.options.worker_count,
            "Flow dispatch loop started"
        );
        let mut poll = tokio::time::interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Flow dispatch loop stopping");
                    break;
                }

                _ = poll.tick() => {
                    if let Err(e) = self.dispatch_ready().await {
                        warn!(error = %e, "Flow dispatch poll failed");
                    }
                }
            }
        }

        self.drain().await
    }

    /// Lease up to the number of idle workers and spawn a task per
    /// request. Only this loop task touches the semaphore's free side,
    /// so the permits counted here cannot be claimed by anyone else.
    async fn dispatch_ready(&self) -> Result<(), DispatchError> {
        let idle = self.pool.available_permits();
        if idle == 0 {
            return Ok(());
        }

        let leased = self.store.lease_flow_processing_requests(idle).await?;
        for request in leased {
            let permit = match Arc::clone(&self.pool).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let store = self.store.clone();
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                let _permit = permit;
                match handler.handle(request.clone()).await {
                    Ok(()) => {
                        if let Err(e) = store
                            .ack_flow_processing_requests(std::slice::from_ref(&request))
                            .await
                        {
                            warn!(
                                client_id = %request.client_id,
                                flow_id = %request.flow_id,
                                error = %e,
                                "Failed to ack flow processing request"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            client_id = %request.client_id,
                            flow_id = %request.flow_id,
                            error = %e,
                            "Flow processing failed, leaving request leased for retry"
                        );
                    }
                }
            });
        }
        Ok(())
    }

    /// Wait for every in-flight task by reacquiring all permits.
    async fn drain(&self) -> Result<(), DispatchError> {
        let all = self.options.worker_count as u32;
        match tokio::time::timeout(self.options.shutdown_timeout, self.pool.acquire_many(all))
            .await
        {
            Ok(_) => {
                info!("Flow dispatch loop stopped");
                Ok(())
            }
            Err(_) => Err(DispatchError::ShutdownTimeout("flow processing")),
        }
    }
}
