//! Splitting and joining `host:port` names.
//!
//! The grammar is the usual one: an optional port after the last colon,
//! with IPv6 literals in brackets. A bare IPv6 literal without brackets
//! is accepted as a host without a port, since its colons cannot mean
//! anything else.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::net::{IpAddr, SocketAddr};

//------------ split_host_port -----------------------------------------------

/// Splits a name into host and port parts.
///
/// The port part is empty when the name carries no port. Returns `None`
/// when the name cannot be a `host[:port]` at all: an unterminated
/// bracket, junk after a bracket, or a bracketed host that is not an
/// IPv6 literal.
pub fn split_host_port(name: &str) -> Option<(&str, &str)> {
    if let Some(rest) = name.strip_prefix('[') {
        let rbracket = rest.find(']')?;
        let host = &rest[..rbracket];
        let after = &rest[rbracket + 1..];
        let port = if after.is_empty() {
            ""
        } else if let Some(port) = after.strip_prefix(':') {
            port
        } else {
            return None;
        };
        // Brackets only make sense around an IPv6 literal.
        if !host.contains(':') {
            return None;
        }
        Some((host, port))
    } else {
        match name.rfind(':') {
            Some(colon) if name.find(':') == Some(colon) => {
                Some((&name[..colon], &name[colon + 1..]))
            }
            // More than one colon without brackets: a bare IPv6
            // literal, so the whole name is the host.
            Some(_) => Some((name, "")),
            None => Some((name, "")),
        }
    }
}

//------------ join_host_port ------------------------------------------------

/// Joins a host and a port back into a name, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

//------------ parse_ip_literal ----------------------------------------------

/// Interprets a host as an IP literal, attaching the given port.
pub fn parse_ip_literal(host: &str, port: u16) -> Option<SocketAddr> {
    host.parse::<IpAddr>()
        .ok()
        .map(|addr| SocketAddr::new(addr, port))
}

//------------ parse_authority -----------------------------------------------

/// Parses an `<ip>:<port>` authority, IPv6 in bracketed form.
///
/// Both parts are mandatory; the host part must be an IP literal.
pub fn parse_authority(authority: &str) -> Option<SocketAddr> {
    let (host, port) = split_host_port(authority)?;
    if port.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    parse_ip_literal(host, port)
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain() {
        assert_eq!(
            split_host_port("example.test:8080"),
            Some(("example.test", "8080"))
        );
        assert_eq!(split_host_port("example.test"), Some(("example.test", "")));
        assert_eq!(split_host_port(""), Some(("", "")));
    }

    #[test]
    fn split_bracketed() {
        assert_eq!(split_host_port("[::1]:443"), Some(("::1", "443")));
        assert_eq!(split_host_port("[::1]"), Some(("::1", "")));
        assert_eq!(
            split_host_port("[2001:db8::1]:53"),
            Some(("2001:db8::1", "53"))
        );
        assert_eq!(split_host_port("[::1"), None);
        assert_eq!(split_host_port("[::1]x"), None);
        assert_eq!(split_host_port("[host]:80"), None);
    }

    #[test]
    fn split_bare_ipv6() {
        assert_eq!(split_host_port("2001:db8::1"), Some(("2001:db8::1", "")));
    }

    #[test]
    fn join() {
        assert_eq!(join_host_port("example.test", 80), "example.test:80");
        assert_eq!(join_host_port("::1", 443), "[::1]:443");
    }

    #[test]
    fn literals() {
        assert_eq!(
            parse_ip_literal("1.2.3.4", 80),
            Some("1.2.3.4:80".parse().unwrap())
        );
        assert_eq!(
            parse_ip_literal("::1", 443),
            Some("[::1]:443".parse().unwrap())
        );
        assert_eq!(parse_ip_literal("example.test", 80), None);
    }

    #[test]
    fn authorities() {
        assert_eq!(
            parse_authority("8.8.8.8:53"),
            Some("8.8.8.8:53".parse().unwrap())
        );
        assert_eq!(
            parse_authority("[2001:4860:4860::8888]:53"),
            Some("[2001:4860:4860::8888]:53".parse().unwrap())
        );
        assert_eq!(parse_authority("8.8.8.8"), None);
        assert_eq!(parse_authority("dns.test:53"), None);
        assert_eq!(parse_authority("8.8.8.8:notaport"), None);
    }
}
