use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use anyhow::{bail, Context, Result};
use reqwest::redirect::Policy;
use reqwest::tls::Version;
use url::Url;

use crate::config::WriterEntry;

/// HTTP client and effective endpoint of one writer.
#[derive(Debug, Clone)]
pub struct WriterClient {
    pub client: reqwest::Client,
    /// Request URL. Differs from the configured one when `tls_server_name`
    /// rewrites the host.
    pub url: Url,
}

/// Builds the writer's client: timeouts, idle pool, proxy, local bind,
/// redirect policy and TLS.
pub fn build_client(cfg: &WriterEntry) -> Result<WriterClient> {
    let mut url = Url::parse(&cfg.url).with_context(|| format!("writer url {:?}", cfg.url))?;

    let mut builder = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout())
        .timeout(cfg.request_timeout())
        .pool_max_idle_per_host(cfg.max_idle_conns_per_host)
        .redirect(if cfg.follow_redirects {
            Policy::limited(10)
        } else {
            Policy::none()
        });

    if cfg.proxy_url.is_empty() {
        builder = builder.no_proxy();
    } else {
        let proxy = reqwest::Proxy::all(&cfg.proxy_url)
            .with_context(|| format!("proxy_url {:?}", cfg.proxy_url))?;
        builder = builder.proxy(proxy);
    }

    if !cfg.interface.is_empty() {
        let local: IpAddr = cfg
            .interface
            .parse()
            .with_context(|| format!("interface {:?}", cfg.interface))?;
        builder = builder.local_address(local);
    }

    if !cfg.tls_ca.is_empty() {
        let pem = std::fs::read(&cfg.tls_ca)
            .with_context(|| format!("reading tls_ca {}", cfg.tls_ca))?;
        let ca = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("parsing tls_ca {}", cfg.tls_ca))?;
        builder = builder.add_root_certificate(ca);
    }

    if !cfg.tls_cert.is_empty() {
        let mut pem = std::fs::read(&cfg.tls_cert)
            .with_context(|| format!("reading tls_cert {}", cfg.tls_cert))?;
        let key = std::fs::read(&cfg.tls_key)
            .with_context(|| format!("reading tls_key {}", cfg.tls_key))?;
        pem.push(b'\n');
        pem.extend_from_slice(&key);
        let identity =
            reqwest::Identity::from_pem(&pem).context("parsing tls_cert/tls_key pair")?;
        builder = builder.identity(identity);
    }

    if cfg.tls_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(v) = tls_version(&cfg.tls_min_version)? {
        builder = builder.min_tls_version(v);
    }
    if let Some(v) = tls_version(&cfg.tls_max_version)? {
        builder = builder.max_tls_version(v);
    }

    if !cfg.tls_server_name.is_empty() {
        let addrs = endpoint_addrs(&url)?;
        url.set_host(Some(&cfg.tls_server_name))
            .with_context(|| format!("tls_server_name {:?}", cfg.tls_server_name))?;
        builder = builder.resolve_to_addrs(&cfg.tls_server_name, &addrs);
    }

    let client = builder.build().context("building remote write client")?;
    Ok(WriterClient { client, url })
}

fn tls_version(raw: &str) -> Result<Option<Version>> {
    Ok(Some(match raw {
        "" => return Ok(None),
        "1.0" => Version::TLS_1_0,
        "1.1" => Version::TLS_1_1,
        "1.2" => Version::TLS_1_2,
        "1.3" => Version::TLS_1_3,
        other => bail!("unsupported TLS version {other:?}"),
    }))
}

/// Socket addresses of the URL's host, so the server name can be swapped
/// into the URL while connecting to the original endpoint.
fn endpoint_addrs(url: &Url) -> Result<Vec<SocketAddr>> {
    let host = url
        .host_str()
        .with_context(|| format!("url {url} has no host"))?;
    let port = url
        .port_or_known_default()
        .with_context(|| format!("url {url} has no port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?
        .collect();
    if addrs.is_empty() {
        bail!("{host}:{port} resolved to no addresses");
    }
    Ok(addrs)
}
