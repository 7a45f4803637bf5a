//! Basic-auth and IP-ACL middleware for the admin surface and (optionally)
//! the proxy endpoints themselves. Kept as a thin layer in front of the
//! cache engine: the engine itself never sees credentials or client
//! addresses.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::AppState;

fn parse_cidrs(cidrs: &[String]) -> Vec<IpNet> {
    cidrs
        .iter()
        .filter_map(|cidr| cidr.parse::<IpNet>().ok())
        .collect()
}

fn ip_in_any(ip: IpAddr, nets: &[IpNet]) -> bool {
    nets.iter().any(|net| net.contains(&ip))
}

/// Checks HTTP Basic auth against `user`/`password`. Returns `true` if no
/// credentials are configured (auth disabled) or the supplied header
/// matches.
fn check_basic_auth(header_value: Option<&str>, user: &str, password: &str) -> bool {
    let Some(header_value) = header_value else {
        return false;
    };
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == password,
        None => false,
    }
}

fn unauthorized() -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, "authentication required").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Basic realm=\"repogate-admin\""),
    );
    response
}

/// Middleware guarding `/_admin/*`: requires basic auth if
/// `auth.admin_user`/`admin_password` are configured, and always allows
/// requests from an exempt CIDR.
pub async fn require_admin_auth(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let exempt = parse_cidrs(&state.config.auth.exempt_cidrs);
    if ip_in_any(addr.ip(), &exempt) {
        return next.run(request).await;
    }

    let (Some(user), Some(password)) = (
        state.config.auth.admin_user.as_deref(),
        state.config.auth.admin_password.as_deref(),
    ) else {
        return next.run(request).await;
    };

    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if check_basic_auth(header_value, user, password) {
        next.run(request).await
    } else {
        unauthorized()
    }
}

/// Middleware guarding cacheable proxy requests: same basic-auth scheme,
/// scoped to `auth.proxy_user`/`proxy_password`, with the same exempt-CIDR
/// bypass.
pub async fn require_proxy_auth(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let exempt = parse_cidrs(&state.config.auth.exempt_cidrs);
    if ip_in_any(addr.ip(), &exempt) {
        return next.run(request).await;
    }

    let (Some(user), Some(password)) = (
        state.config.auth.proxy_user.as_deref(),
        state.config.auth.proxy_password.as_deref(),
    ) else {
        return next.run(request).await;
    };

    let header_value = request
        .headers()
        .get(header::PROXY_AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
        });

    if check_basic_auth(header_value, user, password) {
        next.run(request).await
    } else {
        unauthorized()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic_auth_matches_correct_credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:hunter2");
        let header = format!("Basic {encoded}");
        assert!(check_basic_auth(Some(&header), "alice", "hunter2"));
        assert!(!check_basic_auth(Some(&header), "alice", "wrong"));
    }

    #[test]
    fn missing_header_fails_auth() {
        assert!(!check_basic_auth(None, "alice", "hunter2"));
    }

    #[test]
    fn ip_membership_respects_cidr() {
        let nets = parse_cidrs(&["192.168.1.0/24".to_string()]);
        assert!(ip_in_any("192.168.1.42".parse().unwrap(), &nets));
        assert!(!ip_in_any("10.0.0.1".parse().unwrap(), &nets));
    }
}
