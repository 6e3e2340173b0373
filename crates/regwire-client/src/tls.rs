//! TLS assembly for per-host transports.
//!
//! Hosts that need TLS customization (insecure mode, extra trust anchors,
//! per-host certificate directories, an inline CA, or a client key pair)
//! get their own transport built from the client's template. The root pool
//! starts from the builder's default trust store and appends every
//! configured source; parse failures here are fatal, and the host registry
//! decides whether to fall back to the template transport.

use regwire_core::config::{ClientOptions, TransportSettings};
use regwire_core::host::{HostConfig, TlsMode};
use regwire_core::{Error, Result};
use reqwest::{Certificate, ClientBuilder, Identity};
use std::path::Path;

/// Start a transport builder from the template settings.
pub(crate) fn transport_builder(settings: &TransportSettings) -> ClientBuilder {
    reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(settings.request_timeout())
        .connect_timeout(settings.connect_timeout())
        .pool_idle_timeout(settings.pool_idle_timeout())
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
}

/// Build the template (default) transport.
pub(crate) fn build_default_transport(opts: &ClientOptions) -> Result<reqwest::Client> {
    transport_builder(&opts.transport)
        .build()
        .map_err(|err| Error::Config(format!("failed to build HTTP transport: {err}")))
}

/// Build a TLS-customized transport for `host`, or `None` when the template
/// transport suffices.
pub(crate) fn build_host_transport(
    opts: &ClientOptions,
    host: &HostConfig,
) -> Result<Option<reqwest::Client>> {
    let extra_roots = !opts.root_cas.is_empty() || !opts.ca_files.is_empty();
    let has_dirs = !opts.ca_dirs.is_empty();
    if !host.needs_custom_tls(extra_roots, has_dirs) {
        return Ok(None);
    }

    let mut builder = transport_builder(&opts.transport);
    if host.tls == TlsMode::Insecure {
        builder = builder.danger_accept_invalid_certs(true);
    } else {
        for cert in root_pool(opts, &host.hostname, host.reg_cert.as_deref())? {
            builder = builder.add_root_certificate(cert);
        }
    }

    if let (Some(cert), Some(key)) = (&host.client_cert, &host.client_key) {
        let identity = Identity::from_pem(format!("{key}\n{cert}").as_bytes()).map_err(|err| {
            Error::Config(format!(
                "invalid client certificate for {}: {err}",
                host.hostname
            ))
        })?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map(Some)
        .map_err(|err| Error::Config(format!("failed to build transport for {}: {err}", host.name)))
}

/// Compose the additional root CA pool for a host.
///
/// The builder's default trust store stays in place; this returns the
/// certificates to append: client PEM blocks, client CA files, per-host
/// directory anchors (`<dir>/<hostname>/*.crt`), and the inline host CA.
///
/// # Errors
///
/// Any PEM parse failure is fatal. A missing per-host directory is skipped;
/// other directory read errors are fatal.
pub fn root_pool(
    opts: &ClientOptions,
    hostname: &str,
    inline_host_cert: Option<&str>,
) -> Result<Vec<Certificate>> {
    let mut pool = Vec::new();

    for pem in &opts.root_cas {
        let cert = Certificate::from_pem(pem.as_bytes())
            .map_err(|err| Error::Config(format!("invalid configured root CA: {err}")))?;
        pool.push(cert);
    }

    for file in &opts.ca_files {
        let data = std::fs::read(file).map_err(|err| {
            Error::Config(format!("unable to read CA file {}: {err}", file.display()))
        })?;
        let certs = Certificate::from_pem_bundle(&data).map_err(|err| {
            Error::Config(format!("invalid CA file {}: {err}", file.display()))
        })?;
        pool.extend(certs);
    }

    for dir in &opts.ca_dirs {
        let host_dir = dir.join(hostname);
        match load_cert_dir(&host_dir) {
            Ok(certs) => pool.extend(certs),
            Err(err) => return Err(err),
        }
    }

    if let Some(pem) = inline_host_cert {
        if !pem.is_empty() {
            let cert = Certificate::from_pem(pem.as_bytes()).map_err(|err| {
                Error::Config(format!("invalid registry CA for host {hostname}: {err}"))
            })?;
            pool.push(cert);
        }
    }

    Ok(pool)
}

/// Load every regular `*.crt` file in `dir`; a missing directory is skipped.
fn load_cert_dir(dir: &Path) -> Result<Vec<Certificate>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(Error::Config(format!(
                "unable to read cert directory {}: {err}",
                dir.display()
            )))
        }
    };

    let mut pool = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::Config(format!(
                "unable to read cert directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = entry.path();
        let is_crt = path.extension().is_some_and(|ext| ext == "crt");
        if !is_crt || !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let data = std::fs::read(&path).map_err(|err| {
            Error::Config(format!("unable to read cert {}: {err}", path.display()))
        })?;
        let certs = Certificate::from_pem_bundle(&data)
            .map_err(|err| Error::Config(format!("invalid cert {}: {err}", path.display())))?;
        pool.extend(certs);
    }
    Ok(pool)
}
