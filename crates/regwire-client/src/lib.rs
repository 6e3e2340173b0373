//! Mirror-aware, resumable HTTP request engine for container registries.
//!
//! Given a logical request against a named registry, the [`Client`] selects
//! among the registry and its configured mirrors, handles authentication
//! challenges, applies per-host rate pacing and concurrency throttling,
//! backs off exponentially on failure, and returns a [`Response`] whose body
//! can be read as a resumable, seekable stream that transparently retries
//! interrupted transfers over HTTP `Range` requests.
//!
//! ```no_run
//! use regwire_client::{Client, Request};
//! use reqwest::Method;
//!
//! # async fn demo() -> regwire_core::Result<()> {
//! let client = Client::builder().build()?;
//! let req = Request::new("registry.example.com", Method::GET)
//!     .with_repository("library/busybox")
//!     .with_path("manifests/latest");
//! let mut resp = client.send(req).await?;
//! let manifest = resp.read_all().await?;
//! assert!(!manifest.is_empty());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod auth;
pub mod backoff;
pub mod body;
pub mod client;
pub mod hosts;
pub mod pacer;
pub mod request;
pub mod tls;

pub use auth::{AuthHandler, Challenge, RegistryAuth};
pub use body::Response;
pub use client::{Client, ClientBuilder};
pub use request::{BodySource, Request};

/// Convenient result alias matching the shared regwire error type.
pub type Result<T> = regwire_core::Result<T>;
