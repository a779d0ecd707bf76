pub mod http_transport;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::types::error::TransportError;
use crate::types::types::ContentDescriptor;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// A response whose body has not been read yet.
pub struct FetchResponse {
    /// False when a range was requested but the origin answered `200 OK`
    /// with the whole resource.
    pub range_honored: bool,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

/// The request/response contract the orchestrator depends on.
///
/// Implementations return `Err` for every non-success status; a `200`
/// answer to a range request is success with `range_honored == false`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ContentDescriptor, TransportError>;

    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<FetchResponse, TransportError>;

    async fn fetch_all(&self, url: &str) -> Result<FetchResponse, TransportError>;
}
