pub mod app;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod evolution;
pub mod extract;
pub mod handlers;
pub mod jid;
pub mod maintenance;
pub mod queue;
pub mod realtime;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod templating;
pub mod types;
pub mod webhook;
