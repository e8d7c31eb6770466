//! Orderly shutdown across all relays.
//!
//! Every relay is spawned through the [`ShutdownCoordinator`] with a stop
//! receiver. [`ShutdownCoordinator::shutdown`] flips the stop signal, which
//! makes each relay send `QUIT` and close its write side, then waits for
//! every relay task to finish.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::relay::RelayExit;

pub struct ShutdownCoordinator {
    stop: watch::Sender<bool>,
    relays: JoinSet<RelayExit>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            relays: JoinSet::new(),
        }
    }

    /// Spawn a relay task, handing it its stop receiver.
    pub fn spawn<F, Fut>(&mut self, relay: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = RelayExit> + Send + 'static,
    {
        self.relays.spawn(relay(self.stop.subscribe()));
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Signal every relay to quit and wait until all of them have closed.
    pub async fn shutdown(mut self) -> Vec<RelayExit> {
        tracing::info!(relays = self.relays.len(), "stopping relays");
        self.stop.send_replace(true);

        let mut exits = Vec::with_capacity(self.relays.len());
        while let Some(res) = self.relays.join_next().await {
            match res {
                Ok(exit) => exits.push(exit),
                Err(e) => tracing::error!(error = %e, "relay task failed"),
            }
        }
        tracing::info!("all relays closed");
        exits
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
pub async fn interrupted() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
