//! Logical registry requests.
//!
//! A [`Request`] names a registry host and a path under its API root; the
//! engine decides which concrete mirror serves it. Bodies must be
//! restartable because an attempt can run more than once: either a byte
//! buffer (trivially restartable) or a factory producing a fresh stream
//! plus its content length.

use bytes::Bytes;
use regwire_core::host::{HostConfig, TlsMode};
use regwire_core::throttle::{ReqKind, ReqMeta};
use regwire_core::{Error, Result};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::sync::Arc;
use url::Url;

/// Factory producing a fresh request body stream for each attempt.
pub type BodyFactory = Arc<dyn Fn() -> Result<reqwest::Body> + Send + Sync>;

/// A restartable request body.
#[derive(Clone)]
pub enum BodySource {
    /// In-memory bytes, cloned cheaply per attempt
    Bytes(Bytes),
    /// Stream factory invoked fresh on every attempt
    Stream {
        /// Content length of each produced stream
        len: u64,
        /// The factory
        factory: BodyFactory,
    },
}

impl BodySource {
    /// Content length of the body.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::Stream { len, .. } => *len,
        }
    }

    /// True when the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produce a body for one attempt.
    pub(crate) fn make_body(&self) -> Result<reqwest::Body> {
        match self {
            Self::Bytes(b) => Ok(reqwest::Body::from(b.clone())),
            Self::Stream { factory, .. } => factory(),
        }
    }
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
        }
    }
}

/// A logical request against a named registry.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) kind: ReqKind,
    pub(crate) host: String,
    pub(crate) method: Method,
    pub(crate) direct_url: Option<Url>,
    pub(crate) repository: String,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: Option<BodySource>,
    pub(crate) headers: HeaderMap,
    pub(crate) expect_len: u64,
    pub(crate) transact_len: u64,
    pub(crate) no_prefix: bool,
    pub(crate) no_mirrors: bool,
    pub(crate) ignore_err: bool,
}

impl Request {
    /// Create a request against the named registry host.
    #[must_use]
    pub fn new(host: impl Into<String>, method: Method) -> Self {
        Self {
            kind: ReqKind::Unknown,
            host: host.into(),
            method,
            direct_url: None,
            repository: String::new(),
            path: String::new(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
            expect_len: 0,
            transact_len: 0,
            no_prefix: false,
            no_mirrors: false,
            ignore_err: false,
        }
    }

    /// Set the throttle scheduling hint.
    #[must_use]
    pub const fn with_kind(mut self, kind: ReqKind) -> Self {
        self.kind = kind;
        self
    }

    /// Bypass URL construction and send to this URL on every candidate.
    #[must_use]
    pub fn with_direct_url(mut self, url: Url) -> Self {
        self.direct_url = Some(url);
        self
    }

    /// Set the repository the request addresses.
    #[must_use]
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    /// Set the path under the repository (e.g. `manifests/latest`).
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Append a query parameter when the value is present.
    #[must_use]
    pub fn with_query_opt(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        if let Some(value) = value {
            self.query.push((key.into(), value));
        }
        self
    }

    /// Attach an in-memory body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(BodySource::Bytes(body.into()));
        self
    }

    /// Attach a restartable streaming body with a known content length.
    #[must_use]
    pub fn with_body_factory(mut self, len: u64, factory: BodyFactory) -> Self {
        self.body = Some(BodySource::Stream { len, factory });
        self
    }

    /// Set request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Expected response size, counted toward throttle scheduling.
    #[must_use]
    pub const fn with_expect_len(mut self, len: u64) -> Self {
        self.expect_len = len;
        self
    }

    /// Additional transaction size, counted toward throttle scheduling.
    #[must_use]
    pub const fn with_transact_len(mut self, len: u64) -> Self {
        self.transact_len = len;
        self
    }

    /// Skip the host's configured path prefix.
    #[must_use]
    pub const fn with_no_prefix(mut self) -> Self {
        self.no_prefix = true;
        self
    }

    /// Send only to the upstream host, never to mirrors.
    #[must_use]
    pub const fn with_no_mirrors(mut self) -> Self {
        self.no_mirrors = true;
        self
    }

    /// Treat failures as expected: never penalize host backoff state.
    #[must_use]
    pub const fn with_ignore_err(mut self) -> Self {
        self.ignore_err = true;
        self
    }

    /// The logical host this request addresses.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Throttle metadata for this request.
    #[must_use]
    pub fn throttle_meta(&self) -> ReqMeta {
        let body_len = self.body.as_ref().map_or(0, BodySource::len);
        ReqMeta::new(
            self.kind,
            body_len
                .saturating_add(self.expect_len)
                .saturating_add(self.transact_len),
        )
    }

    /// Build the concrete URL for one candidate host.
    ///
    /// `<scheme>://<hostname>/v2[/prefix][/repo]/<path>?<query>`; the scheme
    /// is `http` only when the host's TLS mode is `disabled`.
    pub(crate) fn build_url(&self, host: &HostConfig) -> Result<Url> {
        if let Some(url) = &self.direct_url {
            return Ok(url.clone());
        }

        let scheme = if host.tls == TlsMode::Disabled {
            "http"
        } else {
            "https"
        };
        let mut raw = format!("{scheme}://{}/v2", host.hostname);
        if !self.no_prefix && !host.path_prefix.is_empty() {
            raw.push('/');
            raw.push_str(&host.path_prefix);
        }
        if !self.repository.is_empty() {
            raw.push('/');
            raw.push_str(&self.repository);
        }
        raw.push('/');
        raw.push_str(&self.path);

        let mut url = Url::parse(&raw)
            .map_err(|err| Error::InvalidEndpoint(format!("invalid request URL `{raw}`: {err}")))?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostConfig {
        HostConfig::new("registry.example.com")
    }

    #[test]
    fn url_with_repository_and_path() {
        let req = Request::new("registry.example.com", Method::GET)
            .with_repository("library/busybox")
            .with_path("manifests/latest");
        let url = req.build_url(&host()).unwrap();
        assert_eq!(
            url.as_str(),
            "https://registry.example.com/v2/library/busybox/manifests/latest"
        );
    }

    #[test]
    fn url_without_repository() {
        let req = Request::new("registry.example.com", Method::GET).with_path("_catalog");
        let url = req.build_url(&host()).unwrap();
        assert_eq!(url.as_str(), "https://registry.example.com/v2/_catalog");
    }

    #[test]
    fn url_with_prefix() {
        let config = host().with_path_prefix("proxy/hub");
        let req = Request::new("registry.example.com", Method::GET)
            .with_repository("library/busybox")
            .with_path("tags/list");
        let url = req.build_url(&config).unwrap();
        assert_eq!(
            url.as_str(),
            "https://registry.example.com/v2/proxy/hub/library/busybox/tags/list"
        );
    }

    #[test]
    fn url_no_prefix_skips_configured_prefix() {
        let config = host().with_path_prefix("proxy/hub");
        let req = Request::new("registry.example.com", Method::GET)
            .with_path("_catalog")
            .with_no_prefix();
        let url = req.build_url(&config).unwrap();
        assert_eq!(url.as_str(), "https://registry.example.com/v2/_catalog");
    }

    #[test]
    fn url_scheme_follows_tls_mode() {
        let config = host().with_tls(TlsMode::Disabled);
        let req = Request::new("registry.example.com", Method::GET).with_path("_catalog");
        assert_eq!(
            req.build_url(&config).unwrap().scheme(),
            "http",
            "disabled TLS uses plain http"
        );

        let config = host().with_tls(TlsMode::Insecure);
        assert_eq!(req.build_url(&config).unwrap().scheme(), "https");
    }

    #[test]
    fn url_query_encoding() {
        let req = Request::new("registry.example.com", Method::GET)
            .with_repository("library/busybox")
            .with_path("tags/list")
            .with_query("n", "50")
            .with_query_opt("last", Some("v1.2".to_string()))
            .with_query_opt("skip", None);
        let url = req.build_url(&host()).unwrap();
        assert_eq!(url.query(), Some("n=50&last=v1.2"));
    }

    #[test]
    fn direct_url_bypasses_construction() {
        let direct = Url::parse("https://cdn.example.com/blobs/sha256:abc").unwrap();
        let req = Request::new("registry.example.com", Method::GET)
            .with_direct_url(direct.clone())
            .with_path("ignored");
        assert_eq!(req.build_url(&host()).unwrap(), direct);
    }

    #[test]
    fn throttle_meta_sums_lengths() {
        let req = Request::new("registry.example.com", Method::PUT)
            .with_kind(ReqKind::Blob)
            .with_body(Bytes::from_static(b"0123456789"))
            .with_expect_len(100)
            .with_transact_len(7);
        let meta = req.throttle_meta();
        assert_eq!(meta.kind, ReqKind::Blob);
        assert_eq!(meta.size, 117);
    }

    #[test]
    fn body_source_restartable() {
        let bytes = BodySource::Bytes(Bytes::from_static(b"abc"));
        assert_eq!(bytes.len(), 3);
        assert!(bytes.make_body().is_ok());
        assert!(bytes.make_body().is_ok());

        let stream = BodySource::Stream {
            len: 5,
            factory: Arc::new(|| Ok(reqwest::Body::from(Bytes::from_static(b"fresh")))),
        };
        assert_eq!(stream.len(), 5);
        assert!(stream.make_body().is_ok());
        assert!(stream.make_body().is_ok());
    }
}
