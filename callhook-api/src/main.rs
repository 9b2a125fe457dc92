use envconfig::Envconfig;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use callhook_api::config::Config;
use callhook_api::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    config.validate().expect("invalid configuration");

    let listener = tokio::net::TcpListener::bind(config.bind())
        .await
        .expect("could not bind port");

    match serve(config, listener, shutdown()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to run callhook api, {}", e),
    }
}
