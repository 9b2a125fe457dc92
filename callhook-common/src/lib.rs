pub mod auth;
pub mod config;
pub mod event;
pub mod ledger;
pub mod metrics;
pub mod normalize;
pub mod repair;
pub mod sheets;
pub mod store;
pub mod time;
