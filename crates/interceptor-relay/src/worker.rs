//! Forwarding worker: pumps one direction of a live connection.
//!
//! Each phase runs two workers. A worker waits on its source socket and
//! its cancellation signal together, feeds every chunk through its plan,
//! and on any ending (EOF, error, cancellation, plan-signalled failure)
//! reports back to its owner with the phase it was born in. It never
//! closes a socket itself.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::plan::Plan;
use crate::socket::PeerSocket;

/// Receives teardown requests from workers.
pub trait ConnectionOwner: Send + Sync {
    /// End `phase` if it is still current; a stale phase is ignored.
    fn request_teardown_and_restart(&self, phase: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client->target"),
            Direction::TargetToClient => f.write_str("target->client"),
        }
    }
}

#[derive(Debug)]
enum Exit {
    Eof,
    Cancelled,
    ReadError(io::Error),
    SendError(io::Error),
    PlanFailure(Duration),
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Eof => f.write_str("remote closed"),
            Exit::Cancelled => f.write_str("cancelled"),
            Exit::ReadError(e) => write!(f, "read failed: {e}"),
            Exit::SendError(e) => write!(f, "send failed: {e}"),
            Exit::PlanFailure(wait) => write!(f, "plan severed connection after {wait:?}"),
        }
    }
}

pub(crate) struct ForwardingWorker {
    pub(crate) source: Arc<PeerSocket>,
    pub(crate) dest: Arc<PeerSocket>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) plan: Arc<Plan>,
    pub(crate) owner: Arc<dyn ConnectionOwner>,
    pub(crate) phase: u64,
    pub(crate) direction: Direction,
    pub(crate) buffer_size: usize,
}

impl ForwardingWorker {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let exit = self.pump().await;

        match &exit {
            Exit::PlanFailure(_) => info!(
                phase = self.phase,
                direction = %self.direction,
                plan = self.plan.name(),
                reason = %exit,
                "worker stopping"
            ),
            _ => debug!(
                phase = self.phase,
                direction = %self.direction,
                reason = %exit,
                "worker stopping"
            ),
        }

        self.owner.request_teardown_and_restart(self.phase);
    }

    async fn pump(&mut self) -> Exit {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.changed() => return Exit::Cancelled,
                ready = self.source.readable() => {
                    if let Err(e) = ready {
                        return Exit::ReadError(e);
                    }
                }
            }

            // A short read is normal; only zero bytes means the peer is done.
            let n = match self.source.try_read(&mut buf) {
                Ok(0) => return Exit::Eof,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Exit::ReadError(e),
            };

            let verdict = tokio::select! {
                biased;
                _ = self.cancel.changed() => return Exit::Cancelled,
                verdict = self.plan.on_data(&buf[..n], &self.dest) => verdict,
            };

            match verdict {
                Ok(None) => {}
                Ok(Some(wait)) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.changed() => return Exit::Cancelled,
                        _ = tokio::time::sleep(wait) => return Exit::PlanFailure(wait),
                    }
                }
                Err(e) => return Exit::SendError(e),
            }
        }
    }
}
