//! Job/context dispatch for headless rendering tabs.
//!
//! Two single-writer actors cooperate:
//!
//! - the **pairing lane** ([`lane`]) owns the idle-context pool, the
//!   pending-job pool and the in-flight ledger, and matches them FIFO;
//! - the **control surface** ([`control`]) owns every in-flight
//!   (job, context) pair, issues all protocol commands and drives each
//!   job through [`machine::advance`].
//!
//! [`Scheduler`] is the handle the rest of the process talks to.

pub mod context;
pub mod control;
pub mod error;
pub mod job;
pub mod lane;
pub mod machine;
pub mod output;
pub mod pool;
pub mod scheduler;

pub use context::Context;
pub use error::DispatchError;
pub use job::{Job, JobOrigin, Stage};
pub use output::{LineWriter, OutputSink};
pub use pool::PoolSnapshot;
pub use scheduler::{Scheduler, SchedulerConfig};
