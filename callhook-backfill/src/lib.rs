pub mod config;
pub mod poller;
pub mod ringba;
pub mod service;
