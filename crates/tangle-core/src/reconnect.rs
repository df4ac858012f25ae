//! Persistent dial loop
//!
//! Cycles through a target list until one dial lands, backing off between
//! attempts on a Fibonacci schedule so a dead server list does not turn
//! into a hot loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{NetError, NetResult};
use crate::mesh::Mesh;

/// Targets and pacing for a [`ConnectionLoop`]
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Endpoints tried in round-robin order
    pub targets: Vec<(String, u16)>,
    /// Give up after this many attempts (`None` = never)
    pub max_iterations: Option<u32>,
    /// Backoff unit; the n-th consecutive failure waits `unit * fib(n)`
    pub cooldown: Duration,
    /// Upper bound on any single backoff
    pub max_cooldown: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            max_iterations: None,
            cooldown: Duration::from_millis(500),
            max_cooldown: Duration::from_secs(60),
        }
    }
}

fn fibonacci(n: u32) -> u64 {
    let mut a: u64 = 0;
    let mut b: u64 = 1;
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

fn backoff(failures: u32, unit: Duration, cap: Duration) -> Duration {
    // fib(30) already exceeds any sensible cap
    let factor = fibonacci(failures.min(30));
    cap.min(unit.saturating_mul(factor.min(u32::MAX as u64) as u32))
}

/// Background task dialing until a connection is established
pub struct ConnectionLoop {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl ConnectionLoop {
    /// Start dialing. The task ends on the first successful connection,
    /// when `max_iterations` runs out, or when [`stop`](Self::stop) is
    /// called.
    pub fn spawn(mesh: Arc<Mesh>, config: LoopConfig) -> NetResult<Self> {
        if config.targets.is_empty() {
            return Err(NetError::IllegalState("no targets to dial".into()));
        }
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(mesh, config, stop_rx));
        Ok(Self { handle, stop })
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to end
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn run(mesh: Arc<Mesh>, config: LoopConfig, mut stop_rx: watch::Receiver<bool>) {
    let mut failures: u32 = 0;
    let mut attempts: u32 = 0;

    for (address, port) in config.targets.iter().cycle() {
        if *stop_rx.borrow() {
            return;
        }
        if let Some(max) = config.max_iterations {
            if attempts >= max {
                debug!(attempts, "Dial loop exhausted");
                return;
            }
        }
        attempts += 1;

        match mesh.connect(address, *port).await {
            Ok(connection) => {
                info!(address, port, id = connection.id(), "Dial loop connected");
                return;
            }
            Err(error) => {
                failures += 1;
                debug!(address, port, %error, failures, "Dial failed");
            }
        }

        let delay = backoff(failures, config.cooldown, config.max_cooldown);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => return,
        }
    }
}
