//! Message handler dispatch loop.
//!
//! Polls the message inbox, groups leased requests by handler name and
//! feeds each group to its registered handler. Handled requests are
//! deleted; failed or unroutable ones are left leased and retried after
//! the lease window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetflow_store::{FlowStore, MessageHandlerRequest};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::{DispatchError, DispatcherHandle, MessageHandler, DEFAULT_SHUTDOWN_TIMEOUT};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(10 * 60);
const DEFAULT_LEASE_LIMIT: usize = 100;

/// Tuning knobs for [`MessageDispatcher`].
#[derive(Debug, Clone)]
pub struct MessageDispatchOptions {
    pub poll_interval: Duration,
    pub lease_time: Duration,
    pub lease_limit: usize,
    pub shutdown_timeout: Duration,
}

impl Default for MessageDispatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_time: DEFAULT_LEASE_TIME,
            lease_limit: DEFAULT_LEASE_LIMIT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Polling loop routing leased inbox batches to named handlers.
pub struct MessageDispatcher {
    store: FlowStore,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    options: MessageDispatchOptions,
}

impl MessageDispatcher {
    pub fn new(store: FlowStore, options: MessageDispatchOptions) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            options,
        }
    }

    /// Register the handler for one handler name. Last registration
    /// wins.
    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Spawn the loop onto the current runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let join_handle = tokio::spawn(self.run(shutdown_rx));
        DispatcherHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), DispatchError> {
        info!(
            handlers = self.handlers.len(),
            "Message dispatch loop started"
        );
        let handlers = Arc::new(self.handlers);
        // One batch in flight at a time, but run off-loop behind a gate
        // so the loop keeps observing the shutdown signal while a
        // handler is busy.
        let gate = Arc::new(Semaphore::new(1));
        let mut poll = tokio::time::interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Message dispatch loop stopping");
                    break;
                }

                _ = poll.tick() => {
                    let Ok(permit) = Arc::clone(&gate).try_acquire_owned() else {
                        continue;
                    };
                    let store = self.store.clone();
                    let handlers = Arc::clone(&handlers);
                    let options = self.options.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = dispatch_leased(&store, &handlers, &options).await {
                            warn!(error = %e, "Message dispatch poll failed");
                        }
                    });
                }
            }
        }

        // A stuck handler is abandoned with its requests still leased;
        // they come back to whoever polls after the lease expires.
        let result = match tokio::time::timeout(self.options.shutdown_timeout, gate.acquire()).await
        {
            Ok(_) => {
                info!("Message dispatch loop stopped");
                Ok(())
            }
            Err(_) => Err(DispatchError::ShutdownTimeout("message handler")),
        };
        result
    }
}

/// Lease a batch and run each handler group to completion. One batch
/// per gate permit: a slow handler delays the next lease instead of
/// stacking tasks.
async fn dispatch_leased(
    store: &FlowStore,
    handlers: &HashMap<String, Arc<dyn MessageHandler>>,
    options: &MessageDispatchOptions,
) -> Result<(), DispatchError> {
    let leased = store
        .lease_message_handler_requests(options.lease_time, options.lease_limit)
        .await?;
    if leased.is_empty() {
        return Ok(());
    }

    let mut by_handler: HashMap<String, Vec<MessageHandlerRequest>> = HashMap::new();
    for request in leased {
        by_handler
            .entry(request.handler_name.clone())
            .or_default()
            .push(request);
    }

    for (name, batch) in by_handler {
        let Some(handler) = handlers.get(&name) else {
            warn!(
                handler = %name,
                count = batch.len(),
                "No handler registered, leaving requests leased"
            );
            continue;
        };
        match handler.handle(batch.clone()).await {
            Ok(()) => {
                if let Err(e) = store.delete_message_handler_requests(&batch).await {
                    warn!(handler = %name, error = %e, "Failed to delete handled requests");
                }
            }
            Err(e) => {
                warn!(
                    handler = %name,
                    count = batch.len(),
                    error = %e,
                    "Message handler failed, leaving requests leased for retry"
                );
            }
        }
    }
    Ok(())
}
