//! Receiver URL, token and post payload validation.
//!
//! Receiver URLs are checked against:
//! - Format and scheme (http/https; plain http only when `allow_http`)
//! - SSRF protections (loopback, private, link-local and reserved ranges,
//!   plus internal hostnames)
//!
//! Hostnames are resolved and every address they resolve to must pass the
//! same range checks. A name that does not resolve at all is accepted on its
//! name alone; delivery to it fails later anyway.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use url::{Host, Url};

use crate::error::{Error, Result};
use crate::types::PostPayload;

/// Post statuses a receiver accepts; anything else is sent as `draft`.
pub const ALLOWED_POST_STATUSES: &[&str] = &["publish", "draft", "pending", "private", "trash"];

const MIN_TOKEN_LEN: usize = 10;

// ---------------------------------------------------------------------------
// URL validation
// ---------------------------------------------------------------------------

/// Validate a receiver base URL and return it parsed.
///
/// Blocks on a DNS lookup for hostnames.
pub fn validate_receiver_url(raw: &str, allow_http: bool) -> Result<Url> {
    validate_receiver_url_with(raw, allow_http, resolve_host)
}

/// [`validate_receiver_url`] with a caller-supplied resolver.
pub fn validate_receiver_url_with<R>(raw: &str, allow_http: bool, resolve: R) -> Result<Url>
where
    R: Fn(&str, u16) -> io::Result<Vec<IpAddr>>,
{
    let parsed = Url::parse(raw.trim())
        .map_err(|e| Error::InvalidReceiver(format!("invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_http => {}
        "http" => {
            return Err(Error::InvalidReceiver(
                "receiver URLs must use https".to_string(),
            ));
        }
        scheme => {
            return Err(Error::InvalidReceiver(format!(
                "unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| Error::InvalidReceiver("URL must have a host".to_string()))?;

    match host {
        Host::Ipv4(v4) => check_ip(IpAddr::V4(v4))?,
        Host::Ipv6(v6) => check_ip(IpAddr::V6(v6))?,
        Host::Domain(domain) => {
            check_hostname(domain)?;
            let port = parsed.port_or_known_default().unwrap_or(443);
            check_resolved(domain, port, resolve)?;
        }
    }

    Ok(parsed)
}

fn resolve_host(host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
    Ok((host, port).to_socket_addrs()?.map(|addr| addr.ip()).collect())
}

fn check_resolved<R>(host: &str, port: u16, resolve: R) -> Result<()>
where
    R: Fn(&str, u16) -> io::Result<Vec<IpAddr>>,
{
    let addrs = match resolve(host, port) {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::debug!(host, error = %e, "Receiver host did not resolve");
            return Ok(());
        }
    };

    match addrs.iter().find(|ip| is_internal_ip(ip)) {
        Some(ip) => Err(Error::InvalidReceiver(format!(
            "destination host {host} resolves to private or reserved address {ip}"
        ))),
        None => Ok(()),
    }
}

fn check_ip(ip: IpAddr) -> Result<()> {
    if is_internal_ip(&ip) {
        return Err(Error::InvalidReceiver(format!(
            "destination host {ip} is a private or reserved address"
        )));
    }
    Ok(())
}

fn check_hostname(host: &str) -> Result<()> {
    let lower = host.trim_end_matches('.').to_ascii_lowercase();
    if lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
    {
        return Err(Error::InvalidReceiver(format!(
            "destination host {host} is a restricted internal hostname"
        )));
    }
    Ok(())
}

/// Whether an address belongs to a loopback, private, link-local or
/// otherwise reserved range.
pub fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => is_internal_v6(v6),
    }
}

fn is_internal_v4(v4: &Ipv4Addr) -> bool {
    let [a, b, ..] = v4.octets();
    v4.is_loopback()                // 127.0.0.0/8
        || v4.is_private()          // 10/8, 172.16/12, 192.168/16
        || v4.is_link_local()       // 169.254/16, cloud metadata
        || v4.is_broadcast()
        || v4.is_unspecified()
        || v4.is_multicast()
        || a == 0                   // 0.0.0.0/8
        || a >= 240                 // 240.0.0.0/4
        || (a == 100 && (b & 0xC0) == 64) // 100.64.0.0/10 (CGNAT)
}

fn is_internal_v6(v6: &Ipv6Addr) -> bool {
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return is_internal_v4(&mapped);
    }
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        || v6.is_multicast()
        || (first & 0xfe00) == 0xfc00 // fc00::/7 unique local
        || (first & 0xffc0) == 0xfe80 // fe80::/10 link local
}

// ---------------------------------------------------------------------------
// Token validation
// ---------------------------------------------------------------------------

/// Validate a bearer token submitted for a receiver.
///
/// Tokens need at least 10 characters. A token with exactly two dots is
/// treated as a JWT and each of its three parts must be base64.
pub fn validate_auth_token(token: &str) -> Result<()> {
    if token.len() < MIN_TOKEN_LEN {
        return Err(Error::InvalidReceiver(format!(
            "token must be at least {MIN_TOKEN_LEN} characters"
        )));
    }

    if token.matches('.').count() == 2 && !token.split('.').all(is_base64) {
        return Err(Error::InvalidReceiver(
            "token looks like a JWT but its parts are not base64".to_string(),
        ));
    }

    Ok(())
}

fn is_base64(part: &str) -> bool {
    !part.is_empty()
        && (STANDARD.decode(part).is_ok_and(|b| STANDARD.encode(b) == part)
            || URL_SAFE_NO_PAD
                .decode(part)
                .is_ok_and(|b| URL_SAFE_NO_PAD.encode(b) == part))
}

// ---------------------------------------------------------------------------
// Post payloads
// ---------------------------------------------------------------------------

/// Reject posts missing the fields every receiver requires.
pub fn validate_post(post: &PostPayload) -> Result<()> {
    if post.post_id <= 0 {
        return Err(Error::Payload(format!("invalid post id: {}", post.post_id)));
    }
    for (field, value) in [
        ("title", &post.title),
        ("content", &post.content),
        ("slug", &post.slug),
    ] {
        if value.trim().is_empty() {
            return Err(Error::Payload(format!("post field `{field}` is empty")));
        }
    }
    Ok(())
}

/// Map a post status onto the set receivers accept.
pub fn normalize_post_status(status: &str) -> &str {
    if ALLOWED_POST_STATUSES.contains(&status) {
        status
    } else {
        "draft"
    }
}
