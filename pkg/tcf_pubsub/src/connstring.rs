use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::PubSubError;

/// `<scheme>://host:port[?k=v&...]`, per `spec.md` §6. `spec.md` §1 calls
/// this an external collaborator kept deliberately thin: no business logic,
/// just a split into scheme/address/options. Grounded on the
/// `strings.Split(connectionString, "://")` + `url.Parse` handling in
/// `examples/original_source/client/client.go`'s `NewClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub scheme: String,
    pub addr: SocketAddr,
    pub options: HashMap<String, String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, PubSubError> {
        let (scheme, rest) = input.split_once("://").ok_or(PubSubError::BadConnectionString)?;
        let (host_port, query) = rest.split_once('?').unwrap_or((rest, ""));
        let addr: SocketAddr = host_port.parse().map_err(|_| PubSubError::BadConnectionString)?;

        let mut options = HashMap::new();
        if !query.is_empty() {
            for pair in query.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    options.insert(k.to_string(), v.to_string());
                }
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            addr,
            options,
        })
    }

    /// `interval=<sec>`, default 10.
    pub fn interval_secs(&self) -> u64 {
        self.options.get("interval").and_then(|v| v.parse().ok()).unwrap_or(10)
    }

    /// `disable_publisher=1`.
    pub fn disable_publisher(&self) -> bool {
        self.options.get("disable_publisher").map(|v| v == "1").unwrap_or(false)
    }

    /// `disable_loopback=1`.
    pub fn disable_loopback(&self) -> bool {
        self.options.get("disable_loopback").map(|v| v == "1").unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_host_port_and_options() {
        let cs = ConnectionString::parse("mangos://127.0.0.1:9100?interval=5&disable_loopback=1").unwrap();
        assert_eq!(cs.scheme, "mangos");
        assert_eq!(cs.addr.port(), 9100);
        assert_eq!(cs.interval_secs(), 5);
        assert!(cs.disable_loopback());
        assert!(!cs.disable_publisher());
    }

    #[test]
    fn defaults_interval_to_ten_seconds() {
        let cs = ConnectionString::parse("mangos://127.0.0.1:9100").unwrap();
        assert_eq!(cs.interval_secs(), 10);
    }

    #[test]
    fn rejects_strings_without_a_scheme_separator() {
        assert!(ConnectionString::parse("127.0.0.1:9100").is_err());
    }
}
