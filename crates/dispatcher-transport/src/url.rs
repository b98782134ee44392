//! Minimal endpoint URL splitter.
//!
//! The accepted shapes are small enough that a scheme/authority/path split
//! covers them all:
//!
//! - `unix:///var/run/dispatcher.sock` (also `unix:/path` and a bare path)
//! - `fd://3`
//! - `ws://HOST:PORT/dispatcher/socket`
//! - `ssh://USER@HOST:PORT`, `ws+ssh://USER@HOST:PORT`

use crate::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: String,
    pub username: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
}

impl ParsedUrl {
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidUrl(format!("missing scheme in {url:?}")))?;
        if scheme.is_empty() {
            return Err(TransportError::InvalidUrl(format!("empty scheme in {url:?}")));
        }

        // unix paths keep everything after the scheme as the path
        if scheme == "unix" {
            return Ok(ParsedUrl {
                scheme: scheme.to_owned(),
                username: None,
                host: None,
                port: None,
                path: rest.to_owned(),
            });
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (username, hostport) = match authority.split_once('@') {
            Some((user, hostport)) => (Some(user.to_owned()), hostport),
            None => (None, authority),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TransportError::InvalidUrl(format!("bad port in {url:?}")))?;
                (host, Some(port))
            }
            None => (hostport, None),
        };

        Ok(ParsedUrl {
            scheme: scheme.to_owned(),
            username,
            host: (!host.is_empty()).then(|| host.to_owned()),
            port,
            path: path.to_owned(),
        })
    }

    /// The raw descriptor number of an `fd://N` url.
    pub fn fd_number(&self) -> Result<i32, TransportError> {
        self.host
            .as_deref()
            .and_then(|h| h.parse::<i32>().ok())
            .ok_or_else(|| TransportError::InvalidUrl("fd:// requires an integer descriptor".to_owned()))
    }
}
