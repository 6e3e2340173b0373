//! End-to-end flows through the public client API.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use regwire_client::{Client, Request};
use regwire_core::config::ClientOptions;
use regwire_core::host::{HostConfig, StaticHosts, TlsMode};
use regwire_core::throttle::ConcurrencyLimit;
use regwire_core::Error;
use reqwest::Method;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn disabled_tls_host(server: &MockServer) -> HostConfig {
    HostConfig::new(server.address().to_string()).with_tls(TlsMode::Disabled)
}

fn quick_opts() -> ClientOptions {
    ClientOptions::new().with_delay_init(Duration::from_millis(10))
}

#[tokio::test]
async fn manifest_fetch_with_bearer_auth() {
    let server = MockServer::start().await;
    let addr = server.address().to_string();
    let challenge = format!("Bearer realm=\"http://{addr}/token\",service=\"{addr}\"");

    Mock::given(method("GET"))
        .and(path("/v2/library/alpine/manifests/3.20"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t-42"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/library/alpine/manifests/3.20"))
        .and(header("Authorization", "Bearer t-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"schemaVersion": 2})))
        .mount(&server)
        .await;

    let client = Client::builder()
        .with_options(quick_opts())
        .with_host_source(StaticHosts::new().with_host(disabled_tls_host(&server)))
        .build()
        .unwrap();

    let request = Request::new(addr, Method::GET)
        .with_repository("library/alpine")
        .with_path("manifests/3.20");
    let mut resp = client.send(request).await.unwrap();
    assert_eq!(resp.status().unwrap(), 200);

    let body = resp.read_all().await.unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(manifest["schemaVersion"], 2);
}

#[tokio::test]
async fn blob_fetch_fails_over_to_mirror() {
    let upstream = MockServer::start().await;
    let mirror = MockServer::start().await;
    let blob_path = "/v2/library/alpine/blobs/sha256:feed";

    Mock::given(method("GET"))
        .and(path(blob_path))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path(blob_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 256]))
        .expect(1)
        .mount(&mirror)
        .await;

    let up_addr = upstream.address().to_string();
    let mir_addr = mirror.address().to_string();
    let throttle = Arc::new(ConcurrencyLimit::new(2));
    let upstream_cfg = HostConfig::new(up_addr.clone())
        .with_tls(TlsMode::Disabled)
        .with_priority(1)
        .with_mirrors(vec![mir_addr.clone()])
        .with_throttle(throttle.clone());
    let mirror_cfg = HostConfig::new(mir_addr.clone())
        .with_tls(TlsMode::Disabled)
        .with_priority(5)
        .with_throttle(throttle.clone());

    let client = Client::builder()
        .with_options(quick_opts())
        .with_host_source(
            StaticHosts::new()
                .with_host(upstream_cfg)
                .with_host(mirror_cfg),
        )
        .build()
        .unwrap();

    let request = Request::new(up_addr, Method::GET)
        .with_repository("library/alpine")
        .with_path("blobs/sha256:feed")
        .with_expect_len(256);
    let mut resp = client.send(request).await.unwrap();
    assert_eq!(resp.mirror(), Some(mir_addr.as_str()));

    let body = resp.read_all().await.unwrap();
    assert_eq!(body.len(), 256);
    assert_eq!(throttle.available(), 2, "all throttle slots returned");
}

#[tokio::test]
async fn seek_and_reread_a_blob() {
    let server = MockServer::start().await;
    let addr = server.address().to_string();
    let blob_path = "/v2/library/alpine/blobs/sha256:cafe";

    Mock::given(method("GET"))
        .and(path(blob_path))
        .and(header("Range", "bytes=6-12"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 6-11/12")
                .set_body_string("world!"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(blob_path))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello world!"))
        .mount(&server)
        .await;

    let client = Client::builder()
        .with_options(quick_opts())
        .with_host_source(StaticHosts::new().with_host(disabled_tls_host(&server)))
        .build()
        .unwrap();

    let request = Request::new(addr, Method::GET)
        .with_repository("library/alpine")
        .with_path("blobs/sha256:cafe");
    let mut resp = client.send(request).await.unwrap();

    let mut buf = [0u8; 5];
    let n = resp.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    let offset = resp.seek(SeekFrom::Start(6)).await.unwrap();
    assert_eq!(offset, 6);
    let rest = resp.read_all().await.unwrap();
    assert_eq!(&rest[..], b"world!");
}

#[tokio::test]
async fn unreachable_registry_reports_transport_failure() {
    let config = HostConfig::new("127.0.0.1:1").with_tls(TlsMode::Disabled);
    let client = Client::builder()
        .with_options(quick_opts().with_retry_limit(1))
        .with_host_source(StaticHosts::new().with_host(config))
        .build()
        .unwrap();

    let request = Request::new("127.0.0.1:1", Method::GET)
        .with_repository("library/alpine")
        .with_path("manifests/latest");
    let err = client.send(request).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}
