//! Webhook URL validation guarding against server-side request forgery.
//!
//! Jobs carry a client-supplied callback URL that this service will POST to
//! from inside the deployment network, so URLs pointing at loopback, private
//! or link-local ranges are rejected. Validation runs at submission time:
//! the client sees a synchronous 400, never a delayed delivery failure.

use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use url::{Host, Url};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WebhookUrlError {
    #[error("webhook url could not be parsed")]
    Invalid,
    #[error("webhook url scheme '{0}' is not allowed, use http or https")]
    ForbiddenScheme(String),
    #[error("webhook url has no host")]
    MissingHost,
    #[error("webhook host {0} points into a private or local network")]
    ForbiddenHost(String),
    #[error("webhook host {0} did not resolve")]
    Unresolvable(String),
}

fn is_forbidden_ipv4(ip: Ipv4Addr) -> bool {
    ip.octets()[0] == 0 // "this network"
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
}

/// Returns [`true`] for addresses a webhook must never reach.
///
/// Covers 127.0.0.0/8, 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16,
/// 169.254.0.0/16, 0.0.0.0/8, the broadcast address, `::1` and
/// IPv4-mapped forms of all of the above.
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_forbidden_ipv4(v4),
            None => v6.is_loopback(),
        },
    }
}

/// Validate a webhook URL, resolving domain hosts so a DNS entry pointing
/// into the internal network is caught before the job is admitted.
pub async fn validate_webhook_url(raw: &str) -> Result<Url, WebhookUrlError> {
    let url = Url::parse(raw).map_err(|_| WebhookUrlError::Invalid)?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(WebhookUrlError::ForbiddenScheme(other.to_owned())),
    }

    match url.host().ok_or(WebhookUrlError::MissingHost)? {
        Host::Ipv4(ip) => {
            if is_forbidden_ipv4(ip) {
                return Err(WebhookUrlError::ForbiddenHost(ip.to_string()));
            }
        }
        Host::Ipv6(ip) => {
            if is_forbidden_ip(IpAddr::V6(ip)) {
                return Err(WebhookUrlError::ForbiddenHost(ip.to_string()));
            }
        }
        Host::Domain(name) => {
            let name = name.to_ascii_lowercase();
            if name == "localhost" || name.ends_with(".localhost") {
                return Err(WebhookUrlError::ForbiddenHost(name));
            }
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs: Vec<_> = tokio::net::lookup_host((name.as_str(), port))
                .await
                .map_err(|_| WebhookUrlError::Unresolvable(name.clone()))?
                .collect();
            if addrs.is_empty() {
                return Err(WebhookUrlError::Unresolvable(name));
            }
            if let Some(resolved) = addrs.iter().find(|addr| is_forbidden_ip(addr.ip())) {
                return Err(WebhookUrlError::ForbiddenHost(format!(
                    "{} ({})",
                    name,
                    resolved.ip()
                )));
            }
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_http_schemes() {
        assert_eq!(
            validate_webhook_url("ftp://example.com/cb").await.unwrap_err(),
            WebhookUrlError::ForbiddenScheme("ftp".to_owned())
        );
        assert_eq!(
            validate_webhook_url("file:///etc/passwd").await.unwrap_err(),
            WebhookUrlError::ForbiddenScheme("file".to_owned())
        );
    }

    #[tokio::test]
    async fn test_rejects_unparseable_urls() {
        assert_eq!(
            validate_webhook_url("not a url").await.unwrap_err(),
            WebhookUrlError::Invalid
        );
    }

    #[tokio::test]
    async fn test_rejects_localhost_names_without_resolving() {
        for raw in [
            "http://localhost:9000/x",
            "https://LOCALHOST/cb",
            "http://api.localhost/cb",
        ] {
            assert!(matches!(
                validate_webhook_url(raw).await.unwrap_err(),
                WebhookUrlError::ForbiddenHost(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_rejects_private_and_local_ip_literals() {
        for raw in [
            "http://127.0.0.1/cb",
            "http://127.8.9.1/cb",
            "http://10.0.0.7/cb",
            "http://172.16.0.1/cb",
            "http://172.31.255.255/cb",
            "http://192.168.1.50/cb",
            "http://169.254.0.5/cb",
            "http://0.0.0.3/cb",
            "http://[::1]/cb",
            "http://[::ffff:10.0.0.1]/cb",
        ] {
            assert!(
                matches!(
                    validate_webhook_url(raw).await.unwrap_err(),
                    WebhookUrlError::ForbiddenHost(_)
                ),
                "expected {} to be rejected",
                raw
            );
        }
    }

    #[tokio::test]
    async fn test_accepts_public_ip_literals() {
        // 172.15.x is just outside 172.16.0.0/12.
        for raw in ["https://93.184.216.34/cb", "http://172.15.0.1:8080/cb"] {
            assert!(validate_webhook_url(raw).await.is_ok(), "{} rejected", raw);
        }
    }

    #[test]
    fn test_forbidden_ip_ranges() {
        assert!(is_forbidden_ip("192.168.0.1".parse().unwrap()));
        assert!(is_forbidden_ip("255.255.255.255".parse().unwrap()));
        assert!(is_forbidden_ip("::1".parse().unwrap()));
        assert!(is_forbidden_ip("::ffff:192.168.0.1".parse().unwrap()));
        assert!(!is_forbidden_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_forbidden_ip("2606:4700::6810:84e5".parse().unwrap()));
    }
}
