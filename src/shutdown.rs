//! Graceful shutdown coordination.
//!
//! Accept loops subscribe to the shutdown signal and stop taking new
//! connections when it fires; in-flight connections are tracked through
//! RAII task handles and get until the configured deadline to finish.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Graceful shutdown requested (SIGTERM)
    Graceful,
    /// Immediate shutdown requested (SIGINT)
    Immediate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "GRACEFUL"),
            ShutdownSignal::Immediate => write!(f, "IMMEDIATE"),
        }
    }
}

/// Shared shutdown state.
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    active_tasks: Arc<AtomicUsize>,
    shutdown_initiated: AtomicBool,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            active_tasks: Arc::new(AtomicUsize::new(0)),
            shutdown_initiated: AtomicBool::new(false),
        }
    }

    /// Track one connection/session; the returned handle releases the
    /// slot on drop.
    pub fn task_handle(&self) -> TaskHandle {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskHandle {
            active_tasks: Arc::clone(&self.active_tasks),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Broadcast the shutdown signal to all accept loops.
    pub fn initiate(&self, signal: ShutdownSignal) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(signal = %signal, "Initiating shutdown");
        let _ = self.shutdown_tx.send(signal);
    }

    /// Wait until every tracked task finished or the deadline elapsed.
    pub async fn wait_for_drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        loop {
            let active = self.active_tasks();
            if active == 0 {
                info!("All connections drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(active, "Drain deadline elapsed, closing remaining connections");
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

/// RAII guard for one tracked task.
#[derive(Debug)]
pub struct TaskHandle {
    active_tasks: Arc<AtomicUsize>,
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}
