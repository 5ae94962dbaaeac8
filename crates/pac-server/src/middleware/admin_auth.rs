//! Bearer-token guard for the management API.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use ipnet::IpNet;
use serde_json::json;
use subtle::ConstantTimeEq;

/// Admin authentication configuration.
#[derive(Debug, Clone)]
pub struct AdminAuthConfig {
    /// Token expected in `Authorization: Bearer`. The API is closed without one.
    pub admin_token: Option<Arc<String>>,
    pub require_https: bool,
    /// Allows plain HTTP from loopback.
    pub dev_mode: bool,
    /// Proxies whose `X-Forwarded-*` headers are believed.
    pub trusted_proxies: Vec<IpNet>,
}

impl AdminAuthConfig {
    /// Reads `PAC_ADMIN_TOKEN`, `PAC_DEV_MODE` and `PAC_TRUSTED_PROXIES`.
    pub fn from_env() -> Self {
        let admin_token = std::env::var("PAC_ADMIN_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(Arc::new);
        let dev_mode = std::env::var("PAC_DEV_MODE").is_ok_and(|v| v.eq_ignore_ascii_case("true"));

        let trusted_proxies = std::env::var("PAC_TRUSTED_PROXIES")
            .map(|proxies| {
                proxies
                    .split(',')
                    .map(str::trim)
                    .filter(|cidr| !cidr.is_empty())
                    .filter_map(|cidr| match cidr.parse::<IpNet>() {
                        Ok(net) => Some(net),
                        Err(e) => {
                            tracing::warn!("Invalid CIDR in PAC_TRUSTED_PROXIES: {} - {}", cidr, e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            admin_token,
            require_https: !dev_mode,
            dev_mode,
            trusted_proxies,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.admin_token.is_some()
    }

    /// Constant-time comparison against the configured token.
    pub fn validate_token(&self, provided: &str) -> bool {
        let Some(expected) = &self.admin_token else {
            return false;
        };
        let expected = expected.as_bytes();
        let provided = provided.as_bytes();
        expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
    }

    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(&ip))
    }

    /// Client IP, walking `X-Forwarded-For` from the right past trusted hops.
    pub fn get_client_ip(&self, peer_ip: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.is_trusted_proxy(peer_ip) {
            return peer_ip;
        }
        let Some(forwarded_for) = forwarded_for else {
            return peer_ip;
        };

        let hops: Vec<IpAddr> = forwarded_for
            .split(',')
            .filter_map(|hop| hop.trim().parse().ok())
            .collect();
        hops.iter()
            .rev()
            .find(|ip| !self.is_trusted_proxy(**ip))
            .or_else(|| hops.first())
            .copied()
            .unwrap_or(peer_ip)
    }

    /// TLS is terminated by a proxy; only a trusted proxy can vouch for it.
    pub fn is_https(&self, peer_ip: IpAddr, forwarded_proto: Option<&str>) -> bool {
        self.is_trusted_proxy(peer_ip)
            && forwarded_proto.is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
    }

    pub fn is_loopback_bypass_allowed(&self, ip: IpAddr) -> bool {
        self.dev_mode && ip.is_loopback()
    }

    fn check(&self, peer_ip: IpAddr, headers: &HeaderMap) -> Result<(), Rejection> {
        let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
        let forwarded_proto = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok());

        if !self.is_trusted_proxy(peer_ip) && (forwarded_for.is_some() || forwarded_proto.is_some()) {
            return Err(Rejection::UntrustedHeaders);
        }

        let client_ip = self.get_client_ip(peer_ip, forwarded_for);
        if self.require_https
            && !self.is_https(peer_ip, forwarded_proto)
            && !self.is_loopback_bypass_allowed(client_ip)
        {
            return Err(Rejection::HttpsRequired);
        }

        if !self.is_configured() {
            return Err(Rejection::Disabled);
        }

        let value = headers
            .get(header::AUTHORIZATION)
            .ok_or(Rejection::MissingAuth)?
            .to_str()
            .map_err(|_| Rejection::InvalidHeader)?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or(Rejection::InvalidAuthType)?;
        if !self.validate_token(token) {
            return Err(Rejection::InvalidToken);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    UntrustedHeaders,
    HttpsRequired,
    Disabled,
    MissingAuth,
    InvalidHeader,
    InvalidAuthType,
    InvalidToken,
}

impl Rejection {
    fn parts(self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Rejection::UntrustedHeaders => (
                StatusCode::BAD_REQUEST,
                "UNTRUSTED_HEADERS",
                "X-Forwarded-* headers from untrusted source",
            ),
            Rejection::HttpsRequired => (
                StatusCode::BAD_REQUEST,
                "HTTPS_REQUIRED",
                "HTTPS is required for the management API",
            ),
            Rejection::Disabled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "API_DISABLED",
                "Admin token not configured. Set PAC_ADMIN_TOKEN.",
            ),
            Rejection::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "MISSING_AUTH",
                "Authorization header required",
            ),
            Rejection::InvalidHeader => (
                StatusCode::BAD_REQUEST,
                "INVALID_HEADER",
                "Invalid Authorization header encoding",
            ),
            Rejection::InvalidAuthType => (
                StatusCode::UNAUTHORIZED,
                "INVALID_AUTH_TYPE",
                "Expected 'Bearer' authentication",
            ),
            Rejection::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "Invalid admin token",
            ),
        }
    }
}

/// Middleware for `axum::middleware::from_fn_with_state`.
pub async fn require_admin(
    State(config): State<Arc<AdminAuthConfig>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    if let Err(rejection) = config.check(peer_ip, req.headers()) {
        let (status, code, message) = rejection.parts();
        tracing::debug!("Management API request from {} rejected: {}", peer_ip, code);
        let mut response =
            (status, Json(json!({"error": {"code": code, "message": message}}))).into_response();
        add_security_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    add_security_headers(response.headers_mut());
    response
}

fn add_security_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: Option<&str>, dev_mode: bool, proxies: &[&str]) -> AdminAuthConfig {
        AdminAuthConfig {
            admin_token: token.map(|t| Arc::new(t.to_string())),
            require_https: !dev_mode,
            dev_mode,
            trusted_proxies: proxies.iter().map(|p| p.parse().unwrap()).collect(),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_token_comparison() {
        let config = config(Some("test-token-123"), true, &[]);
        assert!(config.validate_token("test-token-123"));
        assert!(!config.validate_token("wrong-token"));
        assert!(!config.validate_token("test-token-12"));
        assert!(!AdminAuthConfig { admin_token: None, ..config }.validate_token(""));
    }

    #[test]
    fn test_client_ip_behind_trusted_proxy() {
        let config = config(None, false, &["10.0.0.0/8"]);
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            config.get_client_ip(peer, Some("8.8.8.8, 10.0.0.2")),
            "8.8.8.8".parse::<IpAddr>().unwrap()
        );

        let untrusted: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(config.get_client_ip(untrusted, Some("8.8.8.8")), untrusted);
    }

    #[test]
    fn test_check_rejections() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let dev = config(Some("secret"), true, &[]);
        assert_eq!(dev.check(loopback, &bearer("secret")), Ok(()));
        assert_eq!(dev.check(loopback, &bearer("nope")), Err(Rejection::InvalidToken));
        assert_eq!(dev.check(loopback, &HeaderMap::new()), Err(Rejection::MissingAuth));

        let closed = config(None, true, &[]);
        assert_eq!(closed.check(loopback, &bearer("secret")), Err(Rejection::Disabled));

        let production = config(Some("secret"), false, &[]);
        assert_eq!(
            production.check(loopback, &bearer("secret")),
            Err(Rejection::HttpsRequired)
        );

        let mut forwarded = bearer("secret");
        forwarded.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(
            production.check("1.2.3.4".parse().unwrap(), &forwarded),
            Err(Rejection::UntrustedHeaders)
        );
    }

    #[test]
    fn test_https_through_trusted_proxy() {
        let config = config(Some("secret"), false, &["10.0.0.0/8"]);
        let mut headers = bearer("secret");
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(config.check("10.1.2.3".parse().unwrap(), &headers), Ok(()));
    }
}
