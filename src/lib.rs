//! # mutation-executor
//!
//! `mutation-executor` runs mutation analysis over independent target units:
//! - `mutation::scheduler`: bounded-concurrency execution with completion-order result fan-out
//! - `mutation::worker`: the per-unit loop that patches, tests and records each mutant
//! - `mutation::classifier`: success, failure or skip against a kill-rate threshold
//! - `mutation::sandbox`: a source-tree backend that mutates files in a scratch copy
//!
//! The `cli` feature builds the `mutation-worker` process and the `cargo-mutate` driver.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod mutation;
pub mod prelude;
