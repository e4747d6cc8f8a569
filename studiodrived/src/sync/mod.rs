pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod fileops;
pub mod ignore;
pub mod journal;
pub mod local_watcher;
pub mod paths;
pub mod queue;
pub mod sidecar;
pub mod transfer;
