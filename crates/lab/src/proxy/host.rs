//! Host header parsing for the subdomain proxy.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// `<uuid>--<port>` as the first DNS label.
static SUBDOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9a-f-]{36})--(\d{1,5})$").expect("subdomain regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostParseError {
    #[error("invalid subdomain")]
    InvalidSubdomain,
    #[error("host does not match base domain")]
    WrongBaseDomain,
}

/// Parse a Host header value into `(session_id, port)`.
///
/// Accepts an optional `:port` suffix on the header (the listener port,
/// not the routed one).
pub fn parse_host(
    host: &str,
    base_domain: &str,
) -> Result<(String, u16), HostParseError> {
    // Strip the listener port if present.
    let host = host.split(':').next().unwrap_or(host);

    let prefix = host
        .strip_suffix(base_domain)
        .and_then(|h| h.strip_suffix('.'))
        .ok_or(HostParseError::WrongBaseDomain)?;

    let captures = SUBDOMAIN_RE
        .captures(prefix)
        .ok_or(HostParseError::InvalidSubdomain)?;

    let session_id = captures[1].to_string();
    let port: u32 = captures[2]
        .parse()
        .map_err(|_| HostParseError::InvalidSubdomain)?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(HostParseError::InvalidSubdomain);
    }

    Ok((session_id, port as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0";

    #[test]
    fn parses_valid_host() {
        let host = format!("{}--3000.lab.test", SESSION);
        let (session, port) = parse_host(&host, "lab.test").unwrap();
        assert_eq!(session, SESSION);
        assert_eq!(port, 3000);
    }

    #[test]
    fn strips_listener_port() {
        let host = format!("{}--3000.lab.test:4180", SESSION);
        assert!(parse_host(&host, "lab.test").is_ok());
    }

    #[test]
    fn rejects_single_dash_separator() {
        let host = format!("{}-3000.lab.test", SESSION);
        assert_eq!(
            parse_host(&host, "lab.test"),
            Err(HostParseError::InvalidSubdomain)
        );
    }

    #[test]
    fn rejects_non_numeric_port() {
        let host = format!("{}--web.lab.test", SESSION);
        assert_eq!(
            parse_host(&host, "lab.test"),
            Err(HostParseError::InvalidSubdomain)
        );
    }

    #[test]
    fn rejects_port_zero_and_overflow() {
        let host = format!("{}--0.lab.test", SESSION);
        assert!(parse_host(&host, "lab.test").is_err());
        let host = format!("{}--99999.lab.test", SESSION);
        assert!(parse_host(&host, "lab.test").is_err());
    }

    #[test]
    fn rejects_wrong_base_domain() {
        let host = format!("{}--3000.other.test", SESSION);
        assert_eq!(
            parse_host(&host, "lab.test"),
            Err(HostParseError::WrongBaseDomain)
        );
    }

    #[test]
    fn rejects_short_session_id() {
        assert!(parse_host("abc--3000.lab.test", "lab.test").is_err());
    }
}
