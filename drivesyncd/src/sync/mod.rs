pub mod backoff;
pub mod conflict;
pub mod control;
pub mod discovery;
pub mod engine;
pub mod local_watcher;
pub mod paths;
pub mod progress;
pub mod queue;
pub mod schedule;
pub mod store;
