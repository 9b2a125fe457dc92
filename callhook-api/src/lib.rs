pub mod config;
pub mod handlers;
pub mod ingest;
pub mod janitor;
pub mod queue;
pub mod realtime;
pub mod reconcile;
pub mod server;
pub mod sink;
