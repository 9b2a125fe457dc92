mod admin;
mod app;
mod status;
mod webhook;

pub use app::{app, AppState};
