//! Orchestrator binary library: wires the Document Store, Coordinator, and Log Pipeline
//! crates into a runnable CLI — task creation, migrations, the worker loop, and the
//! standalone lease reaper.

pub mod commands;
pub mod config;
pub mod migrate;
pub mod worker;
