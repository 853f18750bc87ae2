//! Process entrypoint pieces for the kaleido render worker.
//!
//! The binary wires these together: [`config`] reads the environment,
//! [`logging`] installs the stderr subscriber and [`session`] turns
//! request lines on stdin into scheduler calls.

pub mod config;
pub mod logging;
pub mod session;
