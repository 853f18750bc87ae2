//! Idle-context pool, pending-job pool and in-flight ledger.
//!
//! [`Pools`] is plain data with no I/O. The pairing lane owns the only
//! instance; every mutation goes through it, so pairing decisions are
//! made one at a time.

use std::collections::{HashMap, VecDeque};

use kaleido_core::types::{ContextId, JobId};

use crate::context::Context;
use crate::job::Job;

/// A job matched with the context that will run it.
#[derive(Debug)]
pub struct Pairing {
    pub job: Job,
    pub context: Context,
}

/// What happened to a released job's context.
#[derive(Debug)]
pub enum Release {
    /// The context went straight to the oldest pending job.
    Paired(Pairing),
    /// The context joined the idle pool.
    Idle,
    /// The job failed fatally; its context is gone.
    Discarded,
    /// The job was not in flight. Any context that came with it is
    /// handed back for closing.
    Unknown(Option<Context>),
}

/// Everything left in the pools when the lane retires.
#[derive(Debug, Default)]
pub struct Drained {
    pub idle: Vec<Context>,
    pub pending: Vec<Job>,
    pub in_flight: Vec<JobId>,
}

/// Pool contents as seen by the pairing lane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Idle context ids, oldest first.
    pub idle: Vec<ContextId>,
    /// Pending job ids, oldest first.
    pub pending: Vec<JobId>,
    /// In-flight (job, context) pairs, ordered by job id.
    pub in_flight: Vec<(JobId, ContextId)>,
}

#[derive(Debug, Default)]
pub struct Pools {
    idle: VecDeque<Context>,
    pending: VecDeque<Job>,
    in_flight: HashMap<JobId, ContextId>,
}

impl Pools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `job` with the oldest idle context, or queue it.
    pub fn submit_job(&mut self, job: Job) -> Option<Pairing> {
        match self.idle.pop_front() {
            Some(context) => Some(self.pair(job, context)),
            None => {
                self.pending.push_back(job);
                None
            }
        }
    }

    /// Pair `context` with the oldest pending job, or park it.
    pub fn submit_context(&mut self, context: Context) -> Option<Pairing> {
        match self.pending.pop_front() {
            Some(job) => Some(self.pair(job, context)),
            None => {
                self.idle.push_back(context);
                None
            }
        }
    }

    /// Take a finished job off the ledger and recycle its context.
    ///
    /// `context` is `None` when the job failed fatally.
    pub fn release(&mut self, job_id: JobId, context: Option<Context>) -> Release {
        let Some(owned) = self.in_flight.remove(&job_id) else {
            return Release::Unknown(context);
        };
        match context {
            None => Release::Discarded,
            Some(context) if context.id() != owned => {
                // The ledger entry is gone either way; never recycle a
                // context the job did not own.
                tracing::error!(
                    job_id,
                    context_id = context.id(),
                    owned_context_id = owned,
                    "Released context does not match ledger",
                );
                Release::Unknown(Some(context))
            }
            Some(context) => match self.submit_context(context) {
                Some(pairing) => Release::Paired(pairing),
                None => Release::Idle,
            },
        }
    }

    /// Take an idle context out of the pool, e.g. because its tab is gone.
    ///
    /// Returns `None` when the context is not idle.
    pub fn remove_idle(&mut self, context_id: ContextId) -> Option<Context> {
        let index = self.idle.iter().position(|c| c.id() == context_id)?;
        self.idle.remove(index)
    }

    /// No job is waiting or running.
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Empty every pool.
    pub fn drain(&mut self) -> Drained {
        let mut in_flight: Vec<JobId> = self.in_flight.drain().map(|(job_id, _)| job_id).collect();
        in_flight.sort_unstable();
        Drained {
            idle: self.idle.drain(..).collect(),
            pending: self.pending.drain(..).collect(),
            in_flight,
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut in_flight: Vec<(JobId, ContextId)> =
            self.in_flight.iter().map(|(j, c)| (*j, *c)).collect();
        in_flight.sort_unstable();
        PoolSnapshot {
            idle: self.idle.iter().map(Context::id).collect(),
            pending: self.pending.iter().map(Job::id).collect(),
            in_flight,
        }
    }

    fn pair(&mut self, job: Job, context: Context) -> Pairing {
        self.in_flight.insert(job.id(), context.id());
        Pairing { job, context }
    }
}
