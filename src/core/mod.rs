//! Core modules for Keel's persistent state.
//!
//! Leaf-first: `store`, `jsonfile` and `broker` underpin everything;
//! `router` and `path_guard` are pure gates; `action_log`, `records`,
//! `runs`, `context` and `index` own the per-project files; `maintenance`
//! bounds their growth and `engine` wires the control flow together.

pub mod action_log;
pub mod broker;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod index;
pub mod jsonfile;
pub mod logging;
pub mod maintenance;
pub mod path_guard;
pub mod project;
pub mod readme;
pub mod records;
pub mod router;
pub mod runs;
pub mod schemas;
pub mod store;
pub mod time;
