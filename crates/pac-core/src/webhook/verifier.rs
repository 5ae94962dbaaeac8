//! Webhook authenticity checks.

use std::net::IpAddr;

use base64::Engine;
use ipnet::IpNet;

use super::WebhookRequest;
use crate::crypto::{verify_hex_signature, verify_plain_secret, verify_prefixed_signature};
use crate::error::{PacError, Result};

/// Published Bitbucket Cloud webhook source ranges.
const BITBUCKET_CLOUD_RANGES: &[&str] = &[
    "104.192.136.0/21",
    "185.166.140.0/22",
    "18.205.93.0/25",
    "18.234.32.128/25",
    "13.52.5.0/25",
];

/// GitHub: `X-Hub-Signature-256: sha256=<hmac>` over the raw body.
pub fn verify_github(secret: &str, request: &WebhookRequest) -> Result<()> {
    let signature = request
        .header("x-hub-signature-256")
        .ok_or_else(|| PacError::AuthFail("missing X-Hub-Signature-256 header".to_string()))?;
    if !verify_prefixed_signature(secret, signature, &request.body) {
        return Err(PacError::AuthFail("invalid GitHub webhook signature".to_string()));
    }
    Ok(())
}

/// GitLab: `X-Gitlab-Token` carries the shared secret in plain text.
pub fn verify_gitlab(secret: &str, request: &WebhookRequest) -> Result<()> {
    let token = request
        .header("x-gitlab-token")
        .ok_or_else(|| PacError::AuthFail("missing X-Gitlab-Token header".to_string()))?;
    if !verify_plain_secret(secret, token) {
        return Err(PacError::AuthFail("invalid GitLab webhook token".to_string()));
    }
    Ok(())
}

/// Gitea: HMAC in `X-Gitea-Signature` when present, else the plain secret in
/// `Authorization`.
pub fn verify_gitea(secret: &str, request: &WebhookRequest) -> Result<()> {
    if let Some(signature) = request.header("x-gitea-signature") {
        if verify_hex_signature(secret, signature, &request.body) {
            return Ok(());
        }
        return Err(PacError::AuthFail("invalid Gitea webhook signature".to_string()));
    }
    let provided = request
        .header("authorization")
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .ok_or_else(|| PacError::AuthFail("missing Gitea webhook signature".to_string()))?;
    if !verify_plain_secret(secret, provided) {
        return Err(PacError::AuthFail("invalid Gitea webhook secret".to_string()));
    }
    Ok(())
}

/// Bitbucket Data Center: `X-Hub-Signature: sha256=<hmac>`.
pub fn verify_bitbucket_dc(secret: &str, request: &WebhookRequest) -> Result<()> {
    let signature = request
        .header("x-hub-signature")
        .ok_or_else(|| PacError::AuthFail("missing X-Hub-Signature header".to_string()))?;
    if !verify_prefixed_signature(secret, signature, &request.body) {
        return Err(PacError::AuthFail(
            "invalid Bitbucket Data Center webhook signature".to_string(),
        ));
    }
    Ok(())
}

/// Azure DevOps: optional basic-auth password configured on the service hook.
pub fn verify_azure(secret: &str, request: &WebhookRequest) -> Result<()> {
    let header = request
        .header("authorization")
        .ok_or_else(|| PacError::AuthFail("missing Authorization header".to_string()))?;
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| PacError::AuthFail("expected basic authentication".to_string()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| PacError::AuthFail("malformed basic authentication".to_string()))?;
    let decoded = String::from_utf8_lossy(&decoded);
    let password = decoded.split_once(':').map(|(_, p)| p).unwrap_or(&decoded);
    if !verify_plain_secret(secret, password) {
        return Err(PacError::AuthFail("invalid Azure DevOps webhook secret".to_string()));
    }
    Ok(())
}

/// Source-IP allow-list used to authenticate Bitbucket Cloud deliveries.
#[derive(Debug, Clone)]
pub struct SourceIpAllowList {
    nets: Vec<IpNet>,
}

impl SourceIpAllowList {
    /// Bitbucket Cloud ranges plus extra IPs or CIDRs. Invalid extras are
    /// logged and skipped.
    pub fn bitbucket_cloud(additional: &[String]) -> Self {
        let mut nets: Vec<IpNet> = BITBUCKET_CLOUD_RANGES
            .iter()
            .filter_map(|r| r.parse().ok())
            .collect();
        for extra in additional {
            let extra = extra.trim();
            if extra.is_empty() {
                continue;
            }
            match extra.parse::<IpNet>() {
                Ok(net) => nets.push(net),
                Err(_) => match extra.parse::<IpAddr>() {
                    Ok(ip) => nets.push(IpNet::from(ip)),
                    Err(e) => tracing::warn!("Ignoring invalid source IP {}: {}", extra, e),
                },
            }
        }
        Self { nets }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn verify(&self, request: &WebhookRequest) -> Result<()> {
        let ip = source_ip(request)
            .ok_or_else(|| PacError::AuthFail("cannot determine request source IP".to_string()))?;
        if !self.contains(ip) {
            return Err(PacError::AuthFail(format!(
                "source IP {} is not an allowed Bitbucket Cloud address",
                ip
            )));
        }
        Ok(())
    }
}

/// Client IP: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer.
pub fn source_ip(request: &WebhookRequest) -> Option<IpAddr> {
    request
        .header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            request
                .header("x-real-ip")
                .and_then(|v| v.trim().parse().ok())
        })
        .or(request.source_ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hmac_sha256_hex;

    fn request(headers: &[(&str, &str)], body: &[u8]) -> WebhookRequest {
        WebhookRequest {
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
            source_ip: None,
        }
    }

    #[test]
    fn test_github_signature() {
        let body = b"{\"zen\": \"ok\"}";
        let sig = format!("sha256={}", hmac_sha256_hex(b"s3cret", body));
        assert!(verify_github("s3cret", &request(&[("x-hub-signature-256", &sig)], body)).is_ok());
        assert!(matches!(
            verify_github("other", &request(&[("x-hub-signature-256", &sig)], body)),
            Err(PacError::AuthFail(_))
        ));
        assert!(verify_github("s3cret", &request(&[], body)).is_err());
    }

    #[test]
    fn test_gitlab_and_gitea_plain_secrets() {
        assert!(verify_gitlab("tok", &request(&[("x-gitlab-token", "tok")], b"{}")).is_ok());
        assert!(verify_gitlab("tok", &request(&[("x-gitlab-token", "nope")], b"{}")).is_err());

        assert!(verify_gitea("tok", &request(&[("authorization", "tok")], b"{}")).is_ok());
        let sig = hmac_sha256_hex(b"tok", b"{}");
        assert!(verify_gitea("tok", &request(&[("x-gitea-signature", &sig)], b"{}")).is_ok());
        assert!(verify_gitea("tok", &request(&[("x-gitea-signature", "00")], b"{}")).is_err());
    }

    #[test]
    fn test_azure_basic_auth() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("pac:hook-secret");
        let header = format!("Basic {}", encoded);
        assert!(verify_azure("hook-secret", &request(&[("authorization", &header)], b"{}")).is_ok());
        assert!(verify_azure("other", &request(&[("authorization", &header)], b"{}")).is_err());
    }

    #[test]
    fn test_bitbucket_cloud_allow_list() {
        let list = SourceIpAllowList::bitbucket_cloud(&["10.0.0.5".to_string(), "bogus".to_string()]);
        assert!(list.contains("104.192.136.10".parse().unwrap()));
        assert!(list.contains("10.0.0.5".parse().unwrap()));
        assert!(!list.contains("8.8.8.8".parse().unwrap()));

        let req = request(&[("x-forwarded-for", "185.166.140.1, 10.1.1.1")], b"{}");
        assert!(list.verify(&req).is_ok());
        let req = request(&[("x-forwarded-for", "8.8.8.8")], b"{}");
        assert!(list.verify(&req).is_err());
    }
}
