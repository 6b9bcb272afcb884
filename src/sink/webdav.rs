use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use tracing::debug;

use super::{MkdirOutcome, ResultSink, SinkProvider, UploadReceipt};
use crate::error::SinkError;
use crate::job::RemoteStore;

/// Response header some servers (ownCloud, Nextcloud) use to report content checksums.
const CHECKSUM_HEADER: &str = "OC-Checksum";

/// WebDAV client for one remote store.
pub struct WebDavSink {
    client: Client,
    base: Url,
    login: String,
    password: String,
}

impl WebDavSink {
    pub fn new(store: &RemoteStore) -> Result<Self, SinkError> {
        let base = base_url(store)?;
        let client = Client::builder()
            .danger_accept_invalid_certs(store.insecure)
            .build()?;
        Ok(Self {
            client,
            base,
            login: store.login.clone(),
            password: store.password.clone(),
        })
    }

    fn url(&self, remote: &str) -> Result<Url, SinkError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SinkError::Config(format!("{} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(remote.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        if self.login.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.login, Some(&self.password))
        }
    }
}

/// `https://{hostname}/{root}`, or the hostname as-is when it already has a scheme.
fn base_url(store: &RemoteStore) -> Result<Url, SinkError> {
    let host = store.hostname.trim_end_matches('/');
    let origin = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };
    let mut url = Url::parse(&origin)
        .map_err(|e| SinkError::Config(format!("bad hostname {:?}: {}", store.hostname, e)))?;
    url.path_segments_mut()
        .map_err(|_| SinkError::Config(format!("bad hostname {:?}", store.hostname)))?
        .pop_if_empty()
        .extend(store.root.split('/').filter(|s| !s.is_empty()));
    Ok(url)
}

/// Pull the SHA-256 entry out of an `OC-Checksum` value such as
/// `SHA1:... SHA256:...`.
pub fn parse_checksum(value: &str) -> Option<String> {
    value.split_whitespace().find_map(|entry| {
        let (algo, digest) = entry.split_once(':')?;
        algo.eq_ignore_ascii_case("sha256")
            .then(|| digest.to_ascii_lowercase())
    })
}

pub fn mkcol_outcome(status: StatusCode) -> Option<MkdirOutcome> {
    match status {
        StatusCode::METHOD_NOT_ALLOWED => Some(MkdirOutcome::AlreadyExists),
        StatusCode::CONFLICT => Some(MkdirOutcome::MissingParent),
        s if s.is_success() => Some(MkdirOutcome::Created),
        _ => None,
    }
}

#[async_trait]
impl ResultSink for WebDavSink {
    async fn mkdir(&self, remote: &str) -> Result<MkdirOutcome, SinkError> {
        let mkcol = Method::from_bytes(b"MKCOL")
            .map_err(|e| SinkError::Config(e.to_string()))?;
        let response = self.request(mkcol, self.url(remote)?).send().await?;
        let status = response.status();
        debug!(remote, status = status.as_u16(), "MKCOL");
        mkcol_outcome(status).ok_or(SinkError::Status {
            method: "MKCOL",
            path: remote.to_string(),
            status: status.as_u16(),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<UploadReceipt, SinkError> {
        let body = tokio::fs::read(local).await?;
        let response = self
            .request(Method::PUT, self.url(remote)?)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        debug!(remote, status = status.as_u16(), "PUT");
        if !status.is_success() {
            return Err(SinkError::Status {
                method: "PUT",
                path: remote.to_string(),
                status: status.as_u16(),
            });
        }
        let sha256 = response
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_checksum);
        Ok(UploadReceipt { sha256 })
    }
}

/// Builds a [`WebDavSink`] per job from its resolved connection settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebDavProvider;

impl SinkProvider for WebDavProvider {
    fn sink_for(&self, store: &RemoteStore) -> Result<Arc<dyn ResultSink>, SinkError> {
        Ok(Arc::new(WebDavSink::new(store)?))
    }
}
