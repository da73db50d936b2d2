//! Graceful shutdown coordinator
//!
//! Background tasks (the GC loop, the sync server, its peer bridges)
//! subscribe to one broadcast channel. `shutdown` signals them and then
//! waits, up to the grace period, for every subscriber to let go.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            grace,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Tasks still holding a receiver
    pub fn subscribers(&self) -> usize {
        self.shutdown_tx.receiver_count()
    }

    /// Signal every subscriber and wait for them to drain.
    ///
    /// Returns `false` if the grace period ran out first.
    pub async fn shutdown(&self) -> bool {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return true;
            }
            *state = ShutdownState::ShuttingDown;
        }
        info!(subscribers = self.subscribers(), "Initiating graceful shutdown");

        if self.shutdown_tx.send(ShutdownSignal::Graceful).is_err() {
            // Nobody listening
            *self.state.write().await = ShutdownState::Shutdown;
            return true;
        }

        let deadline = Instant::now() + self.grace;
        while self.subscribers() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let drained = self.subscribers() == 0;
        if !drained {
            warn!(remaining = self.subscribers(), "Grace period elapsed with tasks still running");
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
        drained
    }

    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");
        *self.state.write().await = ShutdownState::Shutdown;

        if let Err(e) = self.shutdown_tx.send(ShutdownSignal::Immediate) {
            error!("Failed to send immediate shutdown signal: {}", e);
        }
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }
}

/// Runs one named component until it finishes or shutdown is signalled
pub struct ShutdownHandler {
    rx: broadcast::Receiver<ShutdownSignal>,
    component_name: String,
}

impl ShutdownHandler {
    pub fn new(coordinator: &ShutdownCoordinator, component_name: impl Into<String>) -> Self {
        Self { rx: coordinator.subscribe(), component_name: component_name.into() }
    }

    pub async fn run<Fut>(mut self, component: Fut)
    where
        Fut: std::future::Future<Output = ()>,
    {
        info!(component = %self.component_name, "Starting component");

        tokio::select! {
            _ = component => {
                info!(component = %self.component_name, "Component completed");
            }
            signal = self.rx.recv() => match signal {
                Ok(ShutdownSignal::Graceful) => {
                    info!(component = %self.component_name, "Component stopping");
                }
                Ok(ShutdownSignal::Immediate) => {
                    warn!(component = %self.component_name, "Component stopped immediately");
                }
                Err(e) => {
                    error!(component = %self.component_name, error = %e, "Shutdown channel error");
                }
            }
        }
    }
}

/// Resolves on SIGTERM or SIGINT
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Cannot install signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

/// Resolves on Ctrl+C
#[cfg(windows)]
pub async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            error!(error = %e, "Cannot install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
