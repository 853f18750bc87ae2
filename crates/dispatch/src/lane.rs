//! The pairing lane.
//!
//! A single task owning [`Pools`]. It performs only O(1) pool operations
//! and forwards every pairing to the control surface; it never talks to
//! a tab.

use kaleido_core::types::{ContextId, JobId};
use tokio::sync::{mpsc, oneshot};

use crate::context::Context;
use crate::control::ControlMsg;
use crate::job::Job;
use crate::pool::{Drained, Pairing, PoolSnapshot, Pools, Release};

/// Messages accepted by the pairing lane.
pub enum LaneMsg {
    SubmitJob(Job),
    SubmitContext(Context),
    /// A job reached a terminal state. `context` is `None` when the
    /// context was lost or discarded.
    Release {
        job_id: JobId,
        context: Option<Context>,
    },
    /// A tab reported it is gone. Only idle contexts are removed here;
    /// in-flight ones are discarded when their job fails.
    ContextLost(ContextId),
    Snapshot(oneshot::Sender<PoolSnapshot>),
    /// Answer once no job is pending or in flight.
    WhenSettled(oneshot::Sender<()>),
    /// Empty the pools and retire the lane.
    Drain(oneshot::Sender<Drained>),
}

/// Run the lane until it is drained or every sender is gone.
pub async fn run_lane(
    mut rx: mpsc::UnboundedReceiver<LaneMsg>,
    control: mpsc::UnboundedSender<ControlMsg>,
) {
    let mut pools = Pools::new();
    let mut settle_waiters: Vec<oneshot::Sender<()>> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            LaneMsg::SubmitJob(job) => {
                let job_id = job.id();
                match pools.submit_job(job) {
                    Some(pairing) => dispatch(&control, pairing),
                    None => tracing::debug!(job_id, "Job queued"),
                }
            }
            LaneMsg::SubmitContext(context) => {
                let context_id = context.id();
                match pools.submit_context(context) {
                    Some(pairing) => dispatch(&control, pairing),
                    None => tracing::debug!(context_id, "Context idle"),
                }
            }
            LaneMsg::Release { job_id, context } => match pools.release(job_id, context) {
                Release::Paired(pairing) => dispatch(&control, pairing),
                Release::Idle => tracing::debug!(job_id, "Context recycled"),
                Release::Discarded => tracing::debug!(job_id, "Context discarded"),
                Release::Unknown(context) => {
                    tracing::warn!(job_id, "Release for a job that is not in flight");
                    if let Some(context) = context {
                        tokio::spawn(context.close());
                    }
                }
            },
            LaneMsg::ContextLost(context_id) => match pools.remove_idle(context_id) {
                Some(context) => {
                    tracing::warn!(context_id, "Idle context detached; discarding");
                    tokio::spawn(context.close());
                }
                None => tracing::debug!(context_id, "Lost context is not idle"),
            },
            LaneMsg::Snapshot(reply) => {
                let _ = reply.send(pools.snapshot());
            }
            LaneMsg::WhenSettled(reply) => settle_waiters.push(reply),
            LaneMsg::Drain(reply) => {
                let drained = retire(&mut rx, &mut pools);
                tracing::info!(
                    idle = drained.idle.len(),
                    pending = drained.pending.len(),
                    in_flight = drained.in_flight.len(),
                    "Pairing lane drained",
                );
                let _ = reply.send(drained);
                return;
            }
        }

        if !settle_waiters.is_empty() && pools.is_settled() {
            tracing::debug!(waiters = settle_waiters.len(), "Pools settled");
            for waiter in settle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
    tracing::debug!("Pairing lane stopped");
}

/// Close the mailbox and fold everything still queued into the drain,
/// so no job or context is dropped unreported.
fn retire(rx: &mut mpsc::UnboundedReceiver<LaneMsg>, pools: &mut Pools) -> Drained {
    rx.close();
    let mut drained = pools.drain();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            LaneMsg::SubmitJob(job) => drained.pending.push(job),
            LaneMsg::SubmitContext(context) => drained.idle.push(context),
            LaneMsg::Release { context, .. } => drained.idle.extend(context),
            // Dropping the reply tells a late caller the lane is gone.
            LaneMsg::ContextLost(_)
            | LaneMsg::Snapshot(_)
            | LaneMsg::WhenSettled(_)
            | LaneMsg::Drain(_) => {}
        }
    }
    drained
}

fn dispatch(control: &mpsc::UnboundedSender<ControlMsg>, pairing: Pairing) {
    let job_id = pairing.job.id();
    let context_id = pairing.context.id();
    tracing::debug!(job_id, context_id, "Paired");
    if let Err(mpsc::error::SendError(msg)) = control.send(ControlMsg::Dispatch(pairing)) {
        tracing::error!(job_id, context_id, "Control surface gone; dropping pairing");
        if let ControlMsg::Dispatch(pairing) = msg {
            tokio::spawn(pairing.context.close());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, job};

    #[tokio::test]
    async fn pairings_are_forwarded_and_drain_retires_lane() {
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let lane = tokio::spawn(run_lane(lane_rx, control_tx));

        lane_tx.send(LaneMsg::SubmitJob(job(1))).unwrap();
        lane_tx.send(LaneMsg::SubmitContext(context(10))).unwrap();
        lane_tx.send(LaneMsg::SubmitJob(job(2))).unwrap();

        match control_rx.recv().await {
            Some(ControlMsg::Dispatch(p)) => {
                assert_eq!((p.job.id(), p.context.id()), (1, 10));
            }
            _ => panic!("Expected a dispatch"),
        }

        let (tx, rx) = oneshot::channel();
        lane_tx.send(LaneMsg::Drain(tx)).unwrap();
        lane_tx.send(LaneMsg::SubmitJob(job(3))).ok();
        let drained = rx.await.unwrap();
        lane.await.unwrap();

        assert_eq!(drained.in_flight, vec![1]);
        let pending: Vec<JobId> = drained.pending.iter().map(Job::id).collect();
        assert!(pending.starts_with(&[2]));
        assert!(lane_tx.send(LaneMsg::SubmitJob(job(4))).is_err());
    }

    #[tokio::test]
    async fn settle_waiters_answer_after_last_release() {
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(lane_rx, control_tx));

        lane_tx.send(LaneMsg::SubmitJob(job(1))).unwrap();
        lane_tx.send(LaneMsg::SubmitJob(job(2))).unwrap();
        let (tx, mut settled) = oneshot::channel();
        lane_tx.send(LaneMsg::WhenSettled(tx)).unwrap();
        lane_tx.send(LaneMsg::SubmitContext(context(10))).unwrap();

        let Some(ControlMsg::Dispatch(first)) = control_rx.recv().await else {
            panic!("Expected a dispatch");
        };
        lane_tx
            .send(LaneMsg::Release { job_id: 1, context: Some(first.context) })
            .unwrap();
        let Some(ControlMsg::Dispatch(second)) = control_rx.recv().await else {
            panic!("Expected a dispatch");
        };
        assert_eq!(second.job.id(), 2);
        assert!(settled.try_recv().is_err());

        lane_tx
            .send(LaneMsg::Release { job_id: 2, context: Some(second.context) })
            .unwrap();
        settled.await.unwrap();

        // Already settled: answered straight away.
        let (tx, rx) = oneshot::channel();
        lane_tx.send(LaneMsg::WhenSettled(tx)).unwrap();
        rx.await.unwrap();
    }
}
