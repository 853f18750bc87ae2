//! Domain types shared by the kaleido rendering workers.
//!
//! Nothing in this crate performs I/O apart from probing `PATH` for
//! external converters; protocol plumbing lives in `kaleido-devtools`
//! and scheduling in `kaleido-dispatch`.

pub mod error;
pub mod format;
pub mod report;
pub mod request;
pub mod scope;
pub mod types;
