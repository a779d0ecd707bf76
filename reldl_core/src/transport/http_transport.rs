use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};

use crate::config::DownloadOptions;
use crate::transport::{FetchResponse, Transport};
use crate::types::error::TransportError;
use crate::types::types::{ContentDescriptor, Validator};

const USER_AGENT: &str = concat!("reldl/", env!("CARGO_PKG_VERSION"));

/// `Transport` backed by a tuned reqwest client.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds the client: connection pool sized to the worker count,
    /// connect timeout, TCP_NODELAY.
    pub fn new(options: &DownloadOptions) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout())
            .pool_max_idle_per_host(options.max_concurrency)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| TransportError::permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Sends `Range: bytes=0-0` and reads what the answer reveals. A `206`
    /// proves range support and carries the total size in `Content-Range`.
    /// Values already learned from HEAD are kept.
    async fn range_probe(
        &self,
        url: &str,
        descriptor: &mut ContentDescriptor,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;
        let status = response.status();

        match status {
            StatusCode::PARTIAL_CONTENT => {
                descriptor.supports_ranges = true;
                if descriptor.total_size.is_none() {
                    descriptor.total_size = content_range_total(response.headers());
                }
            }
            StatusCode::OK => {
                descriptor.supports_ranges = false;
                if descriptor.total_size.is_none() {
                    descriptor.total_size = header_u64(response.headers(), header::CONTENT_LENGTH);
                }
                // On a full answer Content-MD5 covers the whole resource.
                if descriptor.integrity_hash.is_none() {
                    descriptor.integrity_hash = content_md5(response.headers());
                }
            }
            other => return Err(TransportError::from_status(other.as_u16(), "range probe")),
        }

        if descriptor.validator.is_none() {
            descriptor.validator = validator(response.headers());
        }

        log::info!(
            "[range_probe] url={}: status={}, supports_ranges={}, total_size={:?}",
            url,
            status,
            descriptor.supports_ranges,
            descriptor.total_size
        );

        // Drop the response; at most one body byte (or an unread full body) is wasted.
        drop(response);
        Ok(())
    }

    fn into_fetch_response(
        response: reqwest::Response,
        range_honored: bool,
    ) -> FetchResponse {
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        FetchResponse {
            range_honored,
            content_length,
            body,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    /// Probes with `HEAD`, falling back to a one-byte range request when HEAD
    /// is rejected or leaves the size or range support unknown.
    async fn probe(&self, url: &str) -> Result<ContentDescriptor, TransportError> {
        let response = self.client.head(url).send().await?;
        let status = response.status();

        let mut descriptor = ContentDescriptor::default();
        let head_usable = if status.is_success() {
            read_descriptor(response.headers(), &mut descriptor);
            true
        } else if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            log::info!("[probe] url={}: HEAD rejected with {}, using range probe", url, status);
            false
        } else {
            return Err(TransportError::from_status(status.as_u16(), "HEAD"));
        };

        log::info!(
            "[probe] url={}: HEAD status={}, total_size={:?}, supports_ranges={}, validator={:?}, content_md5={}",
            url,
            status,
            descriptor.total_size,
            descriptor.supports_ranges,
            descriptor.validator,
            descriptor.integrity_hash.is_some()
        );

        if !head_usable || descriptor.total_size.is_none() || !descriptor.supports_ranges {
            match self.range_probe(url, &mut descriptor).await {
                Ok(()) => {}
                Err(e) if head_usable => {
                    log::warn!("[probe] url={}: range probe failed, keeping HEAD result: {}", url, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(descriptor)
    }

    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<FetchResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, format!("bytes={}-{}", start, end_inclusive))
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(served_start) = content_range_start(response.headers()) {
                    if served_start != start {
                        return Err(TransportError::Permanent {
                            status: Some(206),
                            message: format!(
                                "asked for bytes from {} but origin served from {}",
                                start, served_start
                            ),
                        });
                    }
                }
                Ok(Self::into_fetch_response(response, true))
            }
            StatusCode::OK => {
                log::warn!(
                    "[fetch_range] url={}: sent Range bytes={}-{} but origin answered 200 OK with the whole resource",
                    url,
                    start,
                    end_inclusive
                );
                Ok(Self::into_fetch_response(response, false))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Err(TransportError::RangeNotSatisfiable {
                start,
                end: end_inclusive,
            }),
            other => Err(TransportError::from_status(other.as_u16(), "range GET")),
        }
    }

    async fn fetch_all(&self, url: &str) -> Result<FetchResponse, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::from_status(status.as_u16(), "GET"));
        }
        Ok(Self::into_fetch_response(response, true))
    }
}

/// Fills a descriptor from HEAD headers. `Content-Length` is read from the
/// header itself; reqwest reports the (empty) body length for HEAD.
pub fn read_descriptor(headers: &HeaderMap, descriptor: &mut ContentDescriptor) {
    descriptor.total_size = header_u64(headers, header::CONTENT_LENGTH);
    descriptor.supports_ranges = headers
        .get_all(header::ACCEPT_RANGES)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"));
    descriptor.validator = validator(headers);
    descriptor.integrity_hash = content_md5(headers);
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn header_u64(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<u64> {
    header_str(headers, name).and_then(|s| s.parse::<u64>().ok())
}

/// ETag wins over Last-Modified.
fn validator(headers: &HeaderMap) -> Option<Validator> {
    if let Some(tag) = header_str(headers, header::ETAG) {
        return Some(Validator::ETag(tag.to_string()));
    }
    header_str(headers, header::LAST_MODIFIED).map(|d| Validator::LastModified(d.to_string()))
}

/// Decodes `Content-MD5` (base64 of the 16 raw digest bytes).
fn content_md5(headers: &HeaderMap) -> Option<Vec<u8>> {
    let raw = header_str(headers, "content-md5")?;
    match base64::engine::general_purpose::STANDARD.decode(raw) {
        Ok(digest) if digest.len() == 16 => Some(digest),
        Ok(digest) => {
            log::warn!("ignoring Content-MD5 of {} bytes (expected 16)", digest.len());
            None
        }
        Err(e) => {
            log::warn!("ignoring undecodable Content-MD5 {:?}: {}", raw, e);
            None
        }
    }
}

/// Parses `bytes <start>-<end>/<total>` into its parts.
fn parse_content_range(value: &str) -> Option<(Option<u64>, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let start = range
        .split_once('-')
        .and_then(|(s, _)| s.trim().parse::<u64>().ok());
    let total = total.trim().parse::<u64>().ok();
    Some((start, total))
}

fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_RANGE)
        .and_then(parse_content_range)
        .and_then(|(_, total)| total)
}

fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_RANGE)
        .and_then(parse_content_range)
        .and_then(|(start, _)| start)
}
