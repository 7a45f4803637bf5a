//! `HTTP CONNECT` tunneling: once a client asks to `CONNECT host:port`,
//! we open our own socket to the target (directly, or via an upstream's
//! configured HTTP-CONNECT proxy) and forward bytes in both directions
//! until either side closes. Pure byte forwarding — no parsing,
//! inspection, or caching of tunneled traffic.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;
use url::Url;

use crate::state::AppState;

/// Handles a raw `CONNECT host:port` request by upgrading the connection
/// and relaying bytes to the target, optionally via the default
/// upstream's configured proxy.
pub async fn connect_handler(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    if req.method() != Method::CONNECT {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let proxy = default_upstream_proxy(&state);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(err) = relay(upgraded, &target, proxy.as_ref()).await {
                    warn!(target = %target, error = %err, "CONNECT tunnel failed");
                }
            }
            Err(err) => warn!(error = %err, "CONNECT upgrade failed"),
        }
    });

    Response::new(Body::empty())
}

fn default_upstream_proxy(state: &AppState) -> Option<Url> {
    state
        .config
        .upstreams
        .first()
        .and_then(|upstream| upstream.proxy.clone())
}

/// Rejects a `socks5`/`socks5h` proxy scheme outright: this module only
/// speaks HTTP-CONNECT, and silently mis-speaking the protocol to a
/// SOCKS5 proxy would just hang or get refused downstream.
fn reject_socks5(proxy_url: &Url) -> anyhow::Result<()> {
    if proxy_url.scheme() == "socks5" || proxy_url.scheme() == "socks5h" {
        anyhow::bail!("SOCKS5 upstream proxies are not supported for CONNECT tunneling: {proxy_url}");
    }
    Ok(())
}

async fn relay(
    upgraded: hyper::upgrade::Upgraded,
    target: &str,
    proxy: Option<&Url>,
) -> anyhow::Result<()> {
    let mut client_io = TokioIo::new(upgraded);

    let mut server_stream = match proxy {
        Some(proxy_url) => {
            reject_socks5(proxy_url)?;
            connect_via_http_proxy(proxy_url, target).await?
        }
        None => TcpStream::connect(target).await?,
    };

    copy_bidirectional(&mut client_io, &mut server_stream).await?;
    Ok(())
}

/// Opens a `CONNECT` tunnel through an upstream HTTP proxy to `target`.
/// Callers must reject a `socks5`/`socks5h` scheme before calling this —
/// it only speaks HTTP-CONNECT.
async fn connect_via_http_proxy(proxy_url: &Url, target: &str) -> anyhow::Result<TcpStream> {
    let proxy_host = proxy_url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("proxy url has no host"))?;
    let proxy_port = proxy_url.port_or_known_default().unwrap_or(3128);

    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = [0u8; 1024];
    let mut response = Vec::new();
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await?;
        if n == 0 {
            anyhow::bail!("proxy closed connection before CONNECT response");
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let status_line = String::from_utf8_lossy(&response);
    if !status_line.contains(" 200 ") {
        anyhow::bail!("upstream proxy refused CONNECT: {status_line}");
    }

    Ok(stream)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_socks5_and_socks5h_schemes() {
        let socks5 = Url::parse("socks5://proxy.invalid:1080").unwrap();
        let socks5h = Url::parse("socks5h://proxy.invalid:1080").unwrap();
        assert!(reject_socks5(&socks5).unwrap_err().to_string().contains("SOCKS5"));
        assert!(reject_socks5(&socks5h).unwrap_err().to_string().contains("SOCKS5"));
    }

    #[test]
    fn allows_http_proxy_scheme() {
        let http = Url::parse("http://proxy.invalid:3128").unwrap();
        assert!(reject_socks5(&http).is_ok());
    }
}
