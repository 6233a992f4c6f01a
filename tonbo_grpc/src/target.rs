//! Listen target parsing.
//!
//! The accepted syntax is the small `host:port` / `unix:` / `dns:` family:
//! bare hosts get the scheme's default port, bare numeric ports bind
//! localhost, IPv6 literals are bracketed, and `unix:///` paths must be
//! absolute.

use std::path::PathBuf;

use crate::error::ServerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ListenTarget {
    /// Parses a listen target. `secure` selects the default port (443 vs 80)
    /// when the target names no port of its own.
    pub fn parse(target: &str, secure: bool) -> Result<Self, ServerError> {
        let default_port = if secure { 443 } else { 80 };

        if let Some(rest) = target.strip_prefix("unix:") {
            return parse_unix(target, rest);
        }

        let rest = match target.strip_prefix("dns:") {
            Some(rest) => rest.strip_prefix("///").unwrap_or(rest),
            None => target,
        };

        if rest.is_empty() {
            return Err(ServerError::InvalidTarget(target.to_string()));
        }

        // bracketed IPv6, with or without a port
        if let Some(rest) = rest.strip_prefix('[') {
            let Some((host, after)) = rest.split_once(']') else {
                return Err(ServerError::InvalidTarget(target.to_string()));
            };
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(target, port)?,
                None if after.is_empty() => default_port,
                None => return Err(ServerError::InvalidTarget(target.to_string())),
            };
            return Ok(ListenTarget::Tcp {
                host: host.to_string(),
                port,
            });
        }

        // a bare number is a port on localhost
        if rest.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(ListenTarget::Tcp {
                host: "localhost".to_string(),
                port: parse_port(target, rest)?,
            });
        }

        match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => Ok(ListenTarget::Tcp {
                host: host.to_string(),
                port: parse_port(target, port)?,
            }),
            Some(_) => Err(ServerError::InvalidTarget(target.to_string())),
            None => Ok(ListenTarget::Tcp {
                host: rest.to_string(),
                port: default_port,
            }),
        }
    }

    /// The address string handed to the socket layer.
    pub fn socket_addr(&self) -> String {
        match self {
            ListenTarget::Tcp { host, port } if host.contains(':') => format!("[{}]:{}", host, port),
            ListenTarget::Tcp { host, port } => format!("{}:{}", host, port),
            ListenTarget::Unix(path) => path.display().to_string(),
        }
    }
}

fn parse_unix(target: &str, rest: &str) -> Result<ListenTarget, ServerError> {
    if let Some(path) = rest.strip_prefix("//") {
        // unix:// requires an (empty) authority and an absolute path
        if !path.starts_with('/') {
            return Err(ServerError::InvalidTarget(format!(
                "{} (unix:// paths must be absolute)",
                target
            )));
        }
        Ok(ListenTarget::Unix(PathBuf::from(path)))
    } else if rest.is_empty() {
        Err(ServerError::InvalidTarget(target.to_string()))
    } else {
        // unix: paths may be absolute or relative
        Ok(ListenTarget::Unix(PathBuf::from(rest)))
    }
}

fn parse_port(target: &str, raw: &str) -> Result<u16, ServerError> {
    raw.parse::<u16>()
        .map_err(|_| ServerError::InvalidTarget(target.to_string()))
}
