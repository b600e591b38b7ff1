//! Store endpoint URLs of the form `zk://host:port[,host:port]/path`

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::store::path;

const SCHEME: &str = "zk://";

/// Parsed coordination store endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `host:port` pairs, tried in order
    pub hosts: Vec<String>,
    /// Path component, `None` when the URL names only hosts
    pub path: Option<String>,
}

impl Endpoint {
    /// Parse an endpoint URL
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url.strip_prefix(SCHEME).ok_or_else(|| {
            Error::Config(format!("endpoint '{}' must start with {}", url, SCHEME))
        })?;

        let (hosts, path) = match rest.find('/') {
            Some(i) => (&rest[..i], Some(&rest[i..])),
            None => (rest, None),
        };

        let hosts: Vec<String> = hosts.split(',').map(|h| h.trim().to_string()).collect();
        for host in &hosts {
            let (name, port) = host
                .rsplit_once(':')
                .ok_or_else(|| Error::Config(format!("endpoint host '{}' has no port", host)))?;
            if name.is_empty() {
                return Err(Error::Config(format!("endpoint host '{}' has no name", host)));
            }
            port.parse::<u16>().map_err(|_| {
                Error::Config(format!("endpoint host '{}' has an invalid port", host))
            })?;
        }

        let path = match path {
            None | Some("/") => None,
            Some(p) => {
                path::validate(p).map_err(|e| Error::Config(format!("endpoint path: {}", e)))?;
                Some(p.to_string())
            }
        };

        Ok(Self { hosts, path })
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SCHEME, self.hosts.join(","))?;
        if let Some(path) = &self.path {
            write!(f, "{}", path)?;
        }
        Ok(())
    }
}
