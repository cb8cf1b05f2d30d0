//! Contract between the pipeline core and the embedding platform.

use bytes::Bytes;
use thiserror::Error;

use crate::resource::ResourceUrl;

pub mod http;

pub use http::HttpPlatform;

/// Error delivered in place of response content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request canceled")]
    Canceled,
    #[error("resource not found")]
    NotFound,
    #[error("network error: {0}")]
    Network(String),
    #[error("platform is shut down")]
    ShutDown,
}

pub type UrlResponse = Result<Bytes, RequestError>;

/// Invoked exactly once per request, possibly on a worker thread.
pub type UrlCallback = Box<dyn FnOnce(UrlResponse) + Send + 'static>;

/// Identifies an outstanding URL request for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Services the core consumes from the embedding application.
///
/// Cancellation is advisory: the callback still fires exactly once, possibly with
/// [`RequestError::Canceled`]. After [`Platform::shutdown`] new requests complete immediately
/// with [`RequestError::ShutDown`] and the platform must not call back into the map.
pub trait Platform: Send + Sync {
    fn start_url_request(&self, url: &ResourceUrl, callback: UrlCallback) -> RequestHandle;

    fn cancel_url_request(&self, handle: RequestHandle);

    /// Notifies the application that the map requires a redraw.
    fn request_render(&self);

    fn set_continuous_rendering(&self, enabled: bool);

    fn is_continuous_rendering(&self) -> bool;

    fn shutdown(&self);
}
