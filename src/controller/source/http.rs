//! Resolution of generic HTTP repositories. A HEAD request retrieves the
//! digest and revision headers; redirects are followed manually so the chain
//! stops at the first hop that already carries the digest header.

use crate::controller::digest::calculate_digest;
use crate::controller::error::ReconcileError;
use crate::controller::source::ResolvedSource;
use crate::crd::{Artifact, HttpRepository};
use anyhow::{anyhow, Context};

const DEFAULT_DIGEST_HEADER: &str = "etag";
const MAX_REDIRECTS: usize = 10;

/// Client for HEAD resolution. Redirects are handled by [`resolve`] itself,
/// so automatic following is disabled.
pub fn new_head_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build http client")
}

pub async fn resolve(
    client: &reqwest::Client,
    repository: &HttpRepository,
) -> Result<ResolvedSource, ReconcileError> {
    let digest_header = repository
        .digest_header
        .as_deref()
        .unwrap_or(DEFAULT_DIGEST_HEADER);
    let revision_header = repository.revision_header.as_deref().unwrap_or(digest_header);

    let mut url = repository.url.clone();
    for _ in 0..=MAX_REDIRECTS {
        let response = client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("HEAD request to {url} failed"))
            .map_err(ReconcileError::Fatal)?;

        let digest = header_value(&response, digest_header);
        if response.status().is_redirection() && digest.is_none() {
            let location = header_value(&response, "location").ok_or_else(|| {
                ReconcileError::fatal(format!("redirect from {url} carries no location header"))
            })?;
            url = response
                .url()
                .join(&location)
                .with_context(|| format!("invalid redirect location {location:?}"))
                .map_err(ReconcileError::Fatal)?
                .to_string();
            continue;
        }
        if !response.status().is_success() && !response.status().is_redirection() {
            return Err(ReconcileError::fatal(format!(
                "HEAD request to {url} returned status {}",
                response.status()
            )));
        }

        let digest = digest.ok_or_else(|| {
            ReconcileError::fatal(format!(
                "response from {url} is missing digest header {digest_header:?}"
            ))
        })?;
        let revision = header_value(&response, revision_header).ok_or_else(|| {
            ReconcileError::fatal(format!(
                "response from {url} is missing revision header {revision_header:?}"
            ))
        })?;

        let artifact = Artifact {
            url: response.url().to_string(),
            digest,
            revision,
        };
        let digest = calculate_digest(&(&artifact.url, &artifact.digest, &artifact.revision));
        return Ok(ResolvedSource { artifact, digest });
    }
    Err(ReconcileError::Fatal(anyhow!(
        "too many redirects resolving {}",
        repository.url
    )))
}

/// Header value with surrounding etag quotes stripped.
fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    let value = response.headers().get(name)?.to_str().ok()?;
    Some(value.trim_matches('"').to_string())
}
