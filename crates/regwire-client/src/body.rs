//! Resumable response bodies.
//!
//! A [`Response`] wraps the winning attempt's HTTP response. Reads pull from
//! the underlying body; when the transfer ends short of the expected length
//! the engine penalizes the serving host and transparently re-enters the
//! retry loop with a `Range` continuation, so the caller observes one
//! contiguous byte stream. Seeking re-issues the request at the new offset.

use crate::client::Client;
use crate::hosts::Host;
use crate::request::Request;
use bytes::{Buf, Bytes};
use regwire_core::throttle::ThrottleLease;
use regwire_core::{Error, Result};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::debug;

/// Response to a registry request, with a resumable body.
///
/// Dropping the response releases its throttle slot and closes the body; a
/// fully consumed or explicitly closed body also steps the serving host's
/// backoff down by one.
pub struct Response {
    pub(crate) client: Client,
    pub(crate) request: Request,
    pub(crate) host: Option<Arc<Host>>,
    pub(crate) inner: Option<reqwest::Response>,
    pub(crate) chunk: Bytes,
    pub(crate) read_cur: u64,
    pub(crate) read_max: u64,
    pub(crate) done: bool,
    pub(crate) lease: ThrottleLease,
}

impl Response {
    /// HTTP status of the winning attempt.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.inner.as_ref().map(reqwest::Response::status)
    }

    /// Response headers of the winning attempt.
    #[must_use]
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.inner.as_ref().map(reqwest::Response::headers)
    }

    /// Name of the mirror (or upstream) that served the current body.
    #[must_use]
    pub fn mirror(&self) -> Option<&str> {
        self.host.as_ref().map(|h| h.config.name.as_str())
    }

    /// Bytes delivered to the caller so far.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.read_cur
    }

    /// Expected total body length; zero when unknown.
    #[must_use]
    pub const fn expected_len(&self) -> u64 {
        self.read_max
    }

    /// Read body bytes into `buf`; returns the count, with `0` meaning EOF.
    ///
    /// A short transfer is resumed transparently: the engine re-runs mirror
    /// selection with a `Range` continuation and keeps serving, so the
    /// caller's byte stream has no seam.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.done {
                return Ok(0);
            }
            if !self.chunk.is_empty() {
                let n = buf.len().min(self.chunk.len());
                buf[..n].copy_from_slice(&self.chunk[..n]);
                self.chunk.advance(n);
                self.read_cur += n as u64;
                return Ok(n);
            }
            let Some(inner) = self.inner.as_mut() else {
                return Err(Error::NotFound("no response body available".to_string()));
            };
            match inner.chunk().await {
                Ok(Some(bytes)) => {
                    self.chunk = bytes;
                }
                Ok(None) => {
                    if !self.finish_or_resume(None).await? {
                        return Ok(0);
                    }
                }
                Err(err) => {
                    if !self.finish_or_resume(Some(Error::from(err))).await? {
                        return Ok(0);
                    }
                }
            }
        }
    }

    /// Read the remaining body to the end and close the response.
    pub async fn read_all(&mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        self.close();
        Ok(Bytes::from(out))
    }

    /// Handle end-of-body: terminal completion or a `Range` resumption.
    ///
    /// Returns true when the transfer was resumed and reading can continue.
    async fn finish_or_resume(&mut self, err: Option<Error>) -> Result<bool> {
        // HEAD probes and transfers that reached the expected length are
        // terminal; this includes unknown-length bodies, where any end of
        // body is surfaced as plain EOF even when the transport faulted
        if self.request.method == Method::HEAD || self.read_cur >= self.read_max {
            if let Some(host) = &self.host {
                host.backoff.clear();
            }
            self.done = true;
            self.lease.release();
            return Ok(false);
        }

        debug!(
            read_cur = self.read_cur,
            read_max = self.read_max,
            mirror = self.mirror().unwrap_or(""),
            "short body, attempting range resumption"
        );
        let penalized = match &self.host {
            Some(host) => host.backoff.set(None),
            None => Ok(()),
        };
        let resumed = match penalized {
            Ok(()) => self.retry_loop().await.is_ok(),
            Err(_) => false,
        };
        if resumed {
            return Ok(true);
        }

        // resumption failed: surface the original end-of-body outcome
        self.done = true;
        self.lease.release();
        match err {
            None => Ok(false),
            Some(err) => Err(err),
        }
    }

    /// Reposition the read offset, re-issuing the request when it moves.
    ///
    /// Returns the new offset. Seeking from the end requires a known body
    /// length.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => self
                .read_cur
                .checked_add_signed(delta)
                .ok_or_else(|| Error::Parse("seek position before start of body".to_string()))?,
            SeekFrom::End(delta) => {
                if self.read_max == 0 {
                    return Err(Error::UnsupportedApi(
                        "seek from end requires a known body length".to_string(),
                    ));
                }
                self.read_max
                    .checked_add_signed(delta)
                    .ok_or_else(|| Error::Parse("seek position before start of body".to_string()))?
            }
        };
        if new != self.read_cur {
            self.read_cur = new;
            self.done = false;
            self.chunk = Bytes::new();
            self.retry_loop().await?;
        }
        Ok(self.read_cur)
    }

    /// Close the response: release the throttle slot, credit the serving
    /// host when the body was not already terminal, and drop the body.
    pub fn close(&mut self) {
        self.lease.release();
        if !self.done {
            if let Some(host) = &self.host {
                host.backoff.clear();
            }
        }
        self.done = true;
        self.chunk = Bytes::new();
        self.inner = None;
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.lease.release();
        if !self.done {
            if let Some(host) = &self.host {
                host.backoff.clear();
            }
            self.done = true;
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("mirror", &self.mirror())
            .field("status", &self.status())
            .field("read_cur", &self.read_cur)
            .field("read_max", &self.read_max)
            .field("done", &self.done)
            .field("lease_held", &self.lease.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regwire_core::config::ClientOptions;
    use regwire_core::host::{HostConfig, StaticHosts, TlsMode};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_client(hosts: StaticHosts) -> Client {
        Client::builder()
            .with_options(ClientOptions::new().with_delay_init(Duration::from_millis(10)))
            .with_host_source(hosts)
            .build()
            .unwrap()
    }

    fn bare_response(client: Client) -> Response {
        Response {
            client,
            request: Request::new("r.example", Method::GET),
            host: None,
            inner: None,
            chunk: Bytes::new(),
            read_cur: 0,
            read_max: 0,
            done: false,
            lease: ThrottleLease::empty(),
        }
    }

    #[tokio::test]
    async fn read_after_done_is_eof() {
        let mut resp = bare_response(test_client(StaticHosts::new()));
        resp.done = true;
        let mut buf = [0u8; 8];
        assert_eq!(resp.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_without_a_response_is_not_found() {
        let mut resp = bare_response(test_client(StaticHosts::new()));
        let mut buf = [0u8; 8];
        let err = resp.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn transport_fault_after_complete_transfer_is_quiet_eof() {
        let mut resp = bare_response(test_client(StaticHosts::new()));
        resp.read_cur = 100;
        resp.read_max = 100;

        let resumed = resp
            .finish_or_resume(Some(Error::Transport("connection reset".to_string())))
            .await
            .unwrap();
        assert!(!resumed);
        assert!(resp.done);
        assert!(!resp.lease.is_held());
    }

    #[tokio::test]
    async fn transport_fault_on_unknown_length_body_is_quiet_eof() {
        // no Content-Length was ever seen, so read_max stayed zero
        let mut resp = bare_response(test_client(StaticHosts::new()));
        resp.read_cur = 42;

        let resumed = resp
            .finish_or_resume(Some(Error::Transport("connection reset".to_string())))
            .await
            .unwrap();
        assert!(!resumed);
        assert!(resp.done);
    }

    #[tokio::test]
    async fn head_probe_end_is_terminal() {
        let mut resp = bare_response(test_client(StaticHosts::new()));
        resp.request = Request::new("r.example", Method::HEAD);
        resp.read_max = 512;

        let resumed = resp.finish_or_resume(None).await.unwrap();
        assert!(!resumed);
        assert!(resp.done);
    }

    #[tokio::test]
    async fn interrupted_chunked_body_reads_to_quiet_eof() {
        // a raw server sending a chunked body that dies mid-stream, so the
        // client sees delivered bytes, then a transport fault, and no
        // Content-Length to resume against
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response =
                "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n10\r\npartial-chunk-da";
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            // dropped without the terminating chunk
        });

        let config = HostConfig::new(addr.clone()).with_tls(TlsMode::Disabled);
        let client = test_client(StaticHosts::new().with_host(config));
        let request = Request::new(addr.clone(), Method::GET)
            .with_repository("library/busybox")
            .with_path("blobs/sha256:abc");
        let mut resp = client.send(request).await.unwrap();
        assert_eq!(resp.expected_len(), 0, "chunked response carries no length");

        let body = resp.read_all().await.unwrap();
        assert_eq!(&body[..], b"partial-chunk-da");
        assert_eq!(client.get_host(&addr).backoff.current(), 0);
    }
}
