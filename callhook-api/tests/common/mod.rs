use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use envconfig::Envconfig;
use reqwest::header::CONTENT_TYPE;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use callhook_api::config::Config;
use callhook_api::server::{serve, serve_with_store};
use callhook_common::store::MemoryStore;

/// A configuration backed by the in-memory store and a throwaway ledger file.
pub fn memory_config(name: &str, extra: &[(&str, &str)]) -> (Config, PathBuf) {
    let dir = std::env::temp_dir().join(format!("callhook-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let mut env: HashMap<String, String> = HashMap::from([
        ("MEMORY_STORE".to_owned(), "true".to_owned()),
        ("EXPORT_PROMETHEUS".to_owned(), "false".to_owned()),
        (
            "DEDUP_DATABASE_URL".to_owned(),
            format!("sqlite://{}/ledger.sqlite?mode=rwc", dir.display()),
        ),
    ]);
    for (key, value) in extra {
        env.insert((*key).to_owned(), (*value).to_owned());
    }

    (Config::init_from_hashmap(&env).unwrap(), dir)
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<eyre::Result<()>>>,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let task = tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            shutdown,
            task: Some(task),
        }
    }

    /// Like `for_config`, but writing to `store` so tests can inspect the tables.
    pub async fn for_store(config: Config, store: MemoryStore) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let task = tokio::spawn(async move {
            serve_with_store(config, Arc::new(store), listener, async move {
                notify.notified().await
            })
            .await
        });
        ServerHandle {
            addr,
            shutdown,
            task: Some(task),
        }
    }

    pub async fn post(&self, path: &str, body: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("http://{:?}{}", self.addr, path))
            .body(body.to_owned())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{:?}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }

    /// Stop the server and wait for its background tasks to finish.
    pub async fn stop(mut self) -> eyre::Result<()> {
        self.shutdown.notify_one();
        match self.task.take() {
            Some(task) => task.await.expect("server task panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
