//! Traffic plans: the per-direction policy each chunk passes through.
//!
//! A forwarding worker hands every chunk it reads to its plan together
//! with the destination socket. The plan decides what happens:
//!
//! | Plan            | Effect                                              |
//! |-----------------|-----------------------------------------------------|
//! | `PassThrough`   | send now                                            |
//! | `Drop`          | discard                                             |
//! | `ConstantDelay` | queue; sender loop sends after a fixed delay        |
//! | `RandomDelay`   | queue; delay drawn uniformly per chunk at send time |
//! | `RandomFail`    | send now, then maybe ask for the connection to end  |
//!
//! A plan instance belongs to one direction of one bridge and is reused
//! across every reconnect of that bridge.

mod delay;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use interceptor_core::PlanKind;
use rand::Rng;
use tracing::trace;

use crate::socket::PeerSocket;

pub use delay::{DelayQueue, DelaySchedule};

#[derive(Debug)]
pub enum Plan {
    PassThrough,
    Drop,
    ConstantDelay(DelayQueue),
    RandomDelay(DelayQueue),
    RandomFail { probability: f64, wait: Duration },
}

impl Plan {
    /// Build a runtime plan from its validated kind.
    ///
    /// # Panics
    ///
    /// Delay-family plans spawn their sender loop here, so this must be
    /// called from within a tokio runtime.
    pub fn new(kind: &PlanKind) -> Self {
        match *kind {
            PlanKind::PassThrough => Plan::PassThrough,
            PlanKind::Drop => Plan::Drop,
            PlanKind::ConstantDelay { delay } => {
                Plan::ConstantDelay(DelayQueue::new(DelaySchedule::Constant(delay)))
            }
            PlanKind::RandomDelay { lower, upper } => {
                Plan::RandomDelay(DelayQueue::new(DelaySchedule::Uniform { lower, upper }))
            }
            PlanKind::RandomFail { probability, wait } => Plan::RandomFail { probability, wait },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Plan::PassThrough => "pass_through",
            Plan::Drop => "drop",
            Plan::ConstantDelay(_) => "constant_delay",
            Plan::RandomDelay(_) => "random_delay",
            Plan::RandomFail { .. } => "random_fail_plan",
        }
    }

    /// Handle one chunk read from the source side.
    ///
    /// `Ok(Some(wait))` asks the caller to wait that long and then end
    /// the connection; the chunk has already been forwarded. An error
    /// means the destination could not be written.
    pub async fn on_data(
        &self,
        data: &[u8],
        dest: &Arc<PeerSocket>,
    ) -> io::Result<Option<Duration>> {
        match self {
            Plan::PassThrough => {
                dest.send(data).await?;
                Ok(None)
            }
            Plan::Drop => {
                trace!(bytes = data.len(), "dropping chunk");
                Ok(None)
            }
            Plan::ConstantDelay(queue) | Plan::RandomDelay(queue) => {
                queue.enqueue(data.to_vec(), Arc::clone(dest));
                Ok(None)
            }
            Plan::RandomFail { probability, wait } => {
                dest.send(data).await?;
                let fail = rand::rng().random_bool(*probability);
                Ok(fail.then_some(*wait))
            }
        }
    }

    /// The connection this plan was serving has ended.
    ///
    /// Synchronous: when this returns, nothing queued for the old socket
    /// pair will be sent.
    pub fn on_closed(&self) {
        match self {
            Plan::ConstantDelay(queue) | Plan::RandomDelay(queue) => queue.clear(),
            Plan::PassThrough | Plan::Drop | Plan::RandomFail { .. } => {}
        }
    }
}
