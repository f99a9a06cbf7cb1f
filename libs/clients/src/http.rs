//! Shared plumbing for the HTTP clients.

use std::time::Duration;

use reqwest::{Response, StatusCode, Url};
use tracing::error;

use crate::error::{ClientError, ClientResult};

/// Request timeout for collaborator services.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client() -> ClientResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Parse a service base URL; it must be able to carry path segments.
pub(crate) fn parse_base(base_url: &str) -> ClientResult<Url> {
    let invalid = |reason: String| ClientError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };
    let url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid("not a hierarchical URL".to_string()));
    }
    Ok(url)
}

/// Append path segments to `base`, percent-encoding each one.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Map a non-success response to an error.
///
/// A 404 becomes [`ClientError::NotFound`] for `(kind, name)`.
pub(crate) async fn check(
    response: Response,
    service: &'static str,
    kind: &'static str,
    name: &str,
) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::not_found(kind, name));
    }

    let body = response.text().await.unwrap_or_default();
    error!(service, status = %status, body = %body, "Request failed");
    Err(ClientError::Status {
        service,
        status: status.as_u16(),
        body,
    })
}
