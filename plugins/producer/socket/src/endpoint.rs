use std::fmt;
use std::path::PathBuf;

use fanout_api::PluginError;

const UNIX_SCHEME: &str = "unix://";

/// Куда и каким протоколом producer отправляет данные.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Udp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// `host:port` or `unix:///path`. A bare `:port` means localhost.
    /// Network addresses use TCP when an acknowledgement is expected and
    /// UDP otherwise.
    pub fn parse(address: &str, acknowledged: bool) -> Result<Self, PluginError> {
        let address = address.trim();
        if let Some(path) = address.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(PluginError::config(format!("socket address '{address}' has no path")));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(PluginError::config(format!("socket address '{address}' must be host:port")));
        };
        port.parse::<u16>()
            .map_err(|e| PluginError::config(format!("socket address '{address}': bad port: {e}")))?;
        let host = if host.is_empty() { "localhost" } else { host };
        let addr = format!("{host}:{port}");

        Ok(if acknowledged { Endpoint::Tcp(addr) } else { Endpoint::Udp(addr) })
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Udp(_) => "udp",
            Endpoint::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) | Endpoint::Udp(addr) => write!(f, "{}://{addr}", self.protocol()),
            Endpoint::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}
