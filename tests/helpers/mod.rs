#![allow(dead_code)] // Test helpers appear unused when compiled independently

use reqwest::Client;
use sensor2store::{build_router, MeasurementStore, MemoryCache, SqliteBackend};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

pub struct Receiver {
    pub store: Arc<MeasurementStore>,
    pub url: String,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Receiver {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Find an available TCP port
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

pub fn memory_store(page_limit: usize) -> Arc<MeasurementStore> {
    let backend = SqliteBackend::in_memory(page_limit).expect("failed to open in-memory store");
    Arc::new(MeasurementStore::new(
        Arc::new(backend),
        Arc::new(MemoryCache::new()),
    ))
}

/// Serve the receiver router over `store` on `port`, and wait until it is healthy.
pub async fn spawn_receiver(store: Arc<MeasurementStore>, port: u16) -> Receiver {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("failed to bind receiver listener");
    let app = build_router(store.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("receiver server error: {}", err);
        }
    });

    let url = format!("http://127.0.0.1:{}", port);
    wait_for_health(&Client::new(), &url).await;

    Receiver {
        store,
        url,
        shutdown_tx,
        handle,
    }
}

/// Wait for a server to respond to /health
pub async fn wait_for_health(client: &Client, base_url: &str) {
    poll_until(|| async {
        client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .ok()
            .map(|_| ())
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} to be healthy", base_url));
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}
