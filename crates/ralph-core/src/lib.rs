//! Execution engine for an autonomous fresh-context development loop.
//!
//! An external language-model command-line tool is invoked repeatedly
//! against a plan file until the plan is verified complete, with every
//! intermediate step persisted in version control. Each plan runs to
//! completion on an isolated branch inside its own worktree, so the
//! queue can hold several plans without branch-switching conflicts in
//! the primary checkout.
//!
//! ```text
//! Worker (K)
//!   |
//!   +-- drives Queue (F) + WorktreeManager (I) to set up isolation
//!   |
//!   +-- drives IterationLoop (J) per plan
//!         |
//!         +-- Runner (C), wrapped in Retrier (A)
//!         +-- StreamParser (B) reads the Runner's stdout
//!         +-- Marker extraction (D) on the parsed text
//!         +-- Verifier (E) on completion claims
//!         +-- Progress / Feedback files (G)
//!         +-- Vcs (H)
//! ```

pub mod config;
pub mod iteration;
pub mod markers;
pub mod plan;
pub mod progress;
pub mod retrier;
pub mod runner;
pub mod stream_parser;
pub mod vcs;
pub mod verifier;
pub mod worker;
pub mod worktree;

pub use config::Config;
pub use plan::{Plan, Task};
