use std::net::IpAddr;

use url::{Host, Url};

use crate::error::{AppError, Result};

/// Checks that uploaded bytes look like an image.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(AppError::Validation("Uploaded file is empty".to_string()));
    }

    if !infer::is_image(bytes) {
        return Err(AppError::Validation(
            "Uploaded file is not a supported image".to_string(),
        ));
    }

    Ok(())
}

/// Checks that a remote image URL is safe for the server to fetch.
///
/// Only http(s) is allowed, and hosts that are IP literals must be public.
pub fn validate_remote_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid image_url: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::Validation(
            "image_url must use http or https".to_string(),
        ));
    }

    match url.host() {
        Some(Host::Ipv4(addr)) if is_unsafe_ip(&IpAddr::V4(addr)) => Err(unsafe_host()),
        Some(Host::Ipv6(addr)) if is_unsafe_ip(&IpAddr::V6(addr)) => Err(unsafe_host()),
        Some(Host::Domain(domain))
            if domain.eq_ignore_ascii_case("localhost") || domain.ends_with(".localhost") =>
        {
            Err(unsafe_host())
        }
        Some(_) => Ok(url),
        None => Err(AppError::Validation("image_url has no host".to_string())),
    }
}

fn unsafe_host() -> AppError {
    AppError::Validation("image_url points at a private address".to_string())
}

fn is_unsafe_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => {
            let octets = addr.octets();
            addr.is_loopback()
                || addr.is_link_local()
                || addr.is_multicast()
                || addr.is_unspecified()
                || addr.is_broadcast()
                || octets[0] == 0
                || octets[0] == 10
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
                || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
                || (octets[0] == 192 && octets[1] == 168)
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        }
        IpAddr::V6(addr) => {
            addr.is_loopback()
                || addr.is_multicast()
                || addr.is_unspecified()
                || (addr.segments()[0] & 0xfe00) == 0xfc00
                || (addr.segments()[0] & 0xffc0) == 0xfe80
                || addr.to_ipv4_mapped().is_some_and(|v4| is_unsafe_ip(&IpAddr::V4(v4)))
        }
    }
}
