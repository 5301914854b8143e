//! Minimal URL model for http/https targets.
//!
//! Only the pieces the request serializer and the connector need:
//! scheme, host, port, path. Anything else (userinfo, query splitting,
//! fragments) stays inside `path` untouched.

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Url {
    /// Parse an absolute http/https URL. The port defaults to 80/443,
    /// the path to `/`.
    pub fn parse(input: &str) -> Result<Url, Error> {
        let bad = || Error::InvalidUrl(input.to_string());

        let (scheme, rest) = if let Some(rest) = input.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = input.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(bad());
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rfind(':') {
            Some(idx) => {
                let port = authority[idx + 1..].parse::<u16>().map_err(|_| bad())?;
                (&authority[..idx], port)
            }
            None => (authority, scheme.default_port()),
        };

        if host.is_empty() {
            return Err(bad());
        }

        Ok(Url {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// True when the port is the scheme default and may be omitted from
    /// the `Host:` header.
    pub fn is_default_port(&self) -> bool {
        self.port == self.scheme.default_port()
    }

    /// Same origin, different path. Used for path-only workload entries
    /// joined against a `bench.target` base.
    pub fn with_path(&self, path: &str) -> Url {
        Url {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
            path: path.to_string(),
        }
    }

    /// Rewrite scheme/host/port from `base`, keeping this URL's path.
    /// This is the target-override rule for absolute workload entries.
    pub fn rebased_on(&self, base: &Url) -> Url {
        base.with_path(&self.path)
    }
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_http() {
        let u = Url::parse("http://example.com/foo?x=1").unwrap();
        assert_eq!(u.scheme, Scheme::Http);
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 80);
        assert_eq!(u.path, "/foo?x=1");
        assert!(!u.is_tls());
        assert!(u.is_default_port());
    }

    #[test]
    fn parses_https_with_port() {
        let u = Url::parse("https://example.com:8443").unwrap();
        assert_eq!(u.scheme, Scheme::Https);
        assert_eq!(u.port, 8443);
        assert_eq!(u.path, "/");
        assert!(u.is_tls());
        assert!(!u.is_default_port());
    }

    #[test]
    fn rejects_unknown_scheme_and_empty_host() {
        assert!(Url::parse("ftp://example.com/").is_err());
        assert!(Url::parse("http:///x").is_err());
        assert!(Url::parse("example.com").is_err());
    }

    #[test]
    fn rebase_keeps_path() {
        let base = Url::parse("http://localhost:8080").unwrap();
        let u = Url::parse("https://other.net/a/b").unwrap();
        let r = u.rebased_on(&base);
        assert_eq!(r.host, "localhost");
        assert_eq!(r.port, 8080);
        assert_eq!(r.scheme, Scheme::Http);
        assert_eq!(r.path, "/a/b");
    }
}
