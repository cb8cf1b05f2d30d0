//! Platform implementation over an HTTP client for native applications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use super::{Platform, RequestError, RequestHandle, UrlCallback, UrlResponse};
use crate::resource::ResourceUrl;

struct PendingRequest {
    callback: Arc<Mutex<Option<UrlCallback>>>,
    abort: Option<AbortHandle>,
}

/// Serves `http(s)` and `file` URL requests using a thread-pooled async runtime.
pub struct HttpPlatform {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    requests: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    next_handle: AtomicU64,
    shut_down: AtomicBool,
    render_requested: AtomicBool,
    continuous_rendering: AtomicBool,
}

impl HttpPlatform {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("meridian/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to initialize http client");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("meridian-transport")
            .enable_all()
            .build()
            .expect("failed to initialize transport runtime");

        Self {
            client,
            runtime,
            requests: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            render_requested: AtomicBool::new(false),
            continuous_rendering: AtomicBool::new(false),
        }
    }

    /// Returns whether a redraw was requested since the last call.
    pub fn take_render_request(&self) -> bool {
        self.render_requested.swap(false, Ordering::AcqRel)
    }

    async fn fetch(client: reqwest::Client, url: ResourceUrl) -> UrlResponse {
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|err| RequestError::Network(err.to_string()))?;
            return match tokio::fs::read(path).await {
                Ok(content) => Ok(Bytes::from(content)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(RequestError::NotFound)
                }
                Err(err) => Err(RequestError::Network(err.to_string())),
            };
        }

        let response = client
            .get(url.as_str())
            .send()
            .await
            .map_err(|err| RequestError::Network(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RequestError::NotFound);
        }
        if !status.is_success() {
            log::info!("Failed to load {url}: {status}");
            return Err(RequestError::Network(format!("http status {status}")));
        }

        response
            .bytes()
            .await
            .map_err(|err| RequestError::Network(err.to_string()))
    }
}

impl Default for HttpPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HttpPlatform {
    fn start_url_request(&self, url: &ResourceUrl, callback: UrlCallback) -> RequestHandle {
        if self.shut_down.load(Ordering::Acquire) {
            callback(Err(RequestError::ShutDown));
            return RequestHandle(0);
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let callback = Arc::new(Mutex::new(Some(callback)));

        self.requests.lock().insert(
            id,
            PendingRequest {
                callback: callback.clone(),
                abort: None,
            },
        );

        let client = self.client.clone();
        let url = url.clone();
        let requests = self.requests.clone();
        let task = self.runtime.spawn(async move {
            let response = Self::fetch(client, url).await;
            if let Some(callback) = callback.lock().take() {
                callback(response);
            }
            requests.lock().remove(&id);
        });

        if let Some(pending) = self.requests.lock().get_mut(&id) {
            pending.abort = Some(task.abort_handle());
        }

        RequestHandle(id)
    }

    fn cancel_url_request(&self, handle: RequestHandle) {
        let Some(pending) = self.requests.lock().remove(&handle.0) else {
            return;
        };

        if let Some(abort) = pending.abort {
            abort.abort();
        }
        if let Some(callback) = pending.callback.lock().take() {
            callback(Err(RequestError::Canceled));
        };
    }

    fn request_render(&self) {
        self.render_requested.store(true, Ordering::Release);
    }

    fn set_continuous_rendering(&self, enabled: bool) {
        self.continuous_rendering.store(enabled, Ordering::Release);
    }

    fn is_continuous_rendering(&self) -> bool {
        self.continuous_rendering.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let pending: Vec<_> = {
            let mut requests = self.requests.lock();
            requests.drain().map(|(_, pending)| pending).collect()
        };

        for request in pending {
            if let Some(abort) = request.abort {
                abort.abort();
            }
            if let Some(callback) = request.callback.lock().take() {
                callback(Err(RequestError::Canceled));
            }
        }
    }
}

impl Drop for HttpPlatform {
    fn drop(&mut self) {
        self.shutdown();
    }
}
