use tracing::{debug, trace, warn};

use std::time::Duration;
use tokio::sync::oneshot;

use super::{
    gcode_commands::CMD_PRINT_STATUS,
    tcp_session::{Reconnect, WeakTcpSession},
};

/// Backoff of the keep-alive loop.
///
/// Survives loop restarts, so a session that keeps dropping its socket
/// keeps pinging more slowly until pings succeed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveState {
    floor: Duration,
    step: Duration,
    consecutive_failures: u32,
}

impl KeepAliveState {
    pub fn new(floor: Duration, step: Duration) -> Self {
        Self {
            floor,
            step,
            consecutive_failures: 0,
        }
    }

    /// Applies new timing, keeping the failure count.
    pub fn set_timing(&mut self, floor: Duration, step: Duration) {
        self.floor = floor;
        self.step = step;
    }

    pub fn interval(&self) -> Duration {
        self.floor + self.step * self.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
    }
}

pub(super) struct KeepAliveHandle {
    kill_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl KeepAliveHandle {
    pub(super) fn spawn(session: WeakTcpSession) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(run_keep_alive(session, kill_rx));
        Self { kill_tx, task }
    }

    pub(super) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signals the loop and hands back its task for callers that want to await it.
    pub(super) fn cancel(self) -> tokio::task::JoinHandle<()> {
        let _ = self.kill_tx.send(());
        self.task
    }
}

/// Sends `~M27` every `interval` until cancelled, the session is dropped, or a ping fails.
///
/// Cancellation is observed while sleeping and while queued on the command
/// lock. Once the lock is held the ping runs to completion, an abandoned
/// exchange would leave its reply on the socket. Pings never open a socket:
/// if the session was torn down while this loop waited, it just stops.
async fn run_keep_alive(session: WeakTcpSession, mut kill_rx: oneshot::Receiver<()>) {
    debug!("keep-alive started");
    loop {
        let Some(interval) = session.upgrade().map(|s| s.keep_alive_state().interval()) else {
            break;
        };
        trace!("next keep-alive in {:?}", interval);

        tokio::select! {
            biased;
            _ = &mut kill_rx => {
                debug!("keep-alive cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(session) = session.upgrade() else {
            break;
        };

        let guard = tokio::select! {
            biased;
            _ = &mut kill_rx => {
                debug!("keep-alive cancelled while waiting for the command lock");
                return;
            }
            guard = session.lock_stream() => guard,
        };

        let res = session
            .execute_locked(guard, CMD_PRINT_STATUS, Reconnect::Never)
            .await;
        match res {
            Ok(_) => session.update_keep_alive(|s| s.record_success()),
            Err(e) => {
                let failures = session.update_keep_alive(|s| s.record_failure());
                warn!("keep-alive failed ({} in a row): {}", failures, e);
                break;
            }
        }
    }
    debug!("keep-alive stopped");
}
