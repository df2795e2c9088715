//! A job submission service.
//!
//! Requests for configured services are stored in a database. The scheduler
//! picks them up, selects a runner for each, builds its command line from the
//! request inputs and executes it on the runner's backend (a subprocess, the
//! bundled local queue or a batch system) while keeping the request status
//! current.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod commands;
pub mod config;
pub mod database;
pub mod local_queue;
pub mod runner;
pub mod scheduler;
pub mod selector;
pub mod status;

pub use config::Config;
