//! Whole-process recovery.
//!
//! Relays do not reconnect individually. When one of them sees a
//! `RECONNECT` directive, or its read stream fails, it escalates to the
//! [`Supervisor`]. A restart halts every relay (they stop processing
//! messages and drop their sessions without quitting), waits a moment,
//! then re-executes the current binary with the same arguments and
//! environment. A fatal escalation terminates the process.

use std::time::Duration;

use tokio::sync::{mpsc, watch};

/// Pause between halting the relays and re-executing.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// The chat service told `nick`'s session to reconnect.
    Restart { nick: String },
    /// `nick`'s read stream failed with something other than a clean EOF.
    Fatal { nick: String, reason: String },
}

/// What each relay holds to reach the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Escalation>,
    halt: watch::Receiver<bool>,
}

impl SupervisorHandle {
    pub fn escalate(&self, escalation: Escalation) {
        if self.tx.send(escalation).is_err() {
            tracing::warn!("supervisor gone, escalation dropped");
        }
    }

    /// Resolves once the supervisor has halted all relays.
    pub async fn halted(&mut self) {
        signalled(&mut self.halt).await
    }

    pub fn is_halted(&self) -> bool {
        *self.halt.borrow()
    }
}

pub struct Supervisor {
    tx: mpsc::UnboundedSender<Escalation>,
    rx: mpsc::UnboundedReceiver<Escalation>,
    halt: watch::Sender<bool>,
    restart_delay: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (halt, _) = watch::channel(false);
        Self {
            tx,
            rx,
            halt,
            restart_delay: RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.tx.clone(),
            halt: self.halt.subscribe(),
        }
    }

    /// Wait for the next escalation from any relay.
    pub async fn next_escalation(&mut self) -> Escalation {
        match self.rx.recv().await {
            Some(e) => e,
            // We hold a sender, so the channel never closes.
            None => std::future::pending().await,
        }
    }

    /// Stop message processing in every relay.
    pub fn halt(&self) {
        self.halt.send_replace(true);
    }

    /// Halt every relay, discard escalations queued behind the one being
    /// acted on, then wait out the restart delay. Returns how many were
    /// discarded.
    pub async fn prepare_restart(&mut self) -> usize {
        self.halt();
        // Later escalations belong to the process being replaced.
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(discarded, "dropping escalations queued behind restart");
        }
        tokio::time::sleep(self.restart_delay).await;
        discarded
    }

    /// Halt, wait, then replace this process with a fresh copy of itself.
    ///
    /// Only returns if re-executing failed.
    pub async fn restart(&mut self) -> std::io::Error {
        self.prepare_restart().await;
        tracing::info!("re-executing process");
        restart_process()
    }
}

/// Resolve when `rx` turns true; never resolve if its sender is dropped first.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Replace the current process image: same binary, arguments and environment.
#[cfg(unix)]
pub fn restart_process() -> std::io::Error {
    use std::os::unix::process::CommandExt;

    let mut args = std::env::args_os();
    let argv0 = args.next();
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return e,
    };
    let mut cmd = std::process::Command::new(exe);
    cmd.args(args);
    if let Some(argv0) = argv0 {
        cmd.arg0(argv0);
    }
    cmd.exec()
}

/// Without `exec`, start a fresh copy and exit once it is running.
#[cfg(not(unix))]
pub fn restart_process() -> std::io::Error {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return e,
    };
    match std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .spawn()
    {
        Ok(_) => std::process::exit(0),
        Err(e) => e,
    }
}
