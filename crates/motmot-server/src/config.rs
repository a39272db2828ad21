use anyhow::{Context, bail};
use motmot::DEFAULT_PORT;
use motmot::principal::normalize_domain;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Domain this server is authoritative for.
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Where the SQLite database lives. In-memory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub federation: FederationConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FederationConfig {
    /// Port peer domains are reached on when resolved through DNS.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Connect to peers over TLS.
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Static domain -> address overrides consulted before DNS.
    #[serde(default)]
    pub hosts: HashMap<String, SocketAddr>,
}

impl ServerConfig {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            listen: default_listen(),
            data_dir: None,
            tls: None,
            federation: FederationConfig::default(),
        }
    }

    /// Read a TOML config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::new(""));
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Normalize the domain and check cross-field requirements.
    pub fn validate(mut self) -> anyhow::Result<Self> {
        if self.domain.is_empty() {
            bail!("no domain configured (set `domain` or pass --domain)");
        }
        self.domain = normalize_domain(&self.domain)?;
        if self.federation.tls && self.federation.ca_path.is_none() {
            bail!("federation.tls requires federation.ca_path");
        }
        if self.federation.timeout_secs == 0 {
            bail!("federation.timeout_secs must be positive");
        }
        Ok(self)
    }

    pub fn federation_timeout(&self) -> Duration {
        Duration::from_secs(self.federation.timeout_secs)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            tls: false,
            ca_path: None,
            hosts: HashMap::new(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn minimal_file_gets_defaults() {
        let config: ServerConfig = toml::from_str(r#"domain = "A.Test""#).unwrap();
        let config = config.validate().unwrap();
        assert_eq!(config.domain, "a.test");
        assert_eq!(config.listen.port(), 8888);
        assert_eq!(config.federation.port, 8888);
        assert_eq!(config.federation_timeout(), Duration::from_secs(10));
        assert!(config.data_dir.is_none());
        assert!(config.tls.is_none());
    }

    #[test]
    fn full_file_parses() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
domain = "a.test"
listen = "127.0.0.1:9000"
data_dir = "/var/lib/motmot"

[tls]
cert_path = "/etc/motmot/cert.pem"
key_path = "/etc/motmot/key.pem"

[federation]
port = 9001
timeout_secs = 3
tls = true
ca_path = "/etc/motmot/ca.pem"

[federation.hosts]
"b.test" = "10.0.0.2:9001"
"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap().validate().unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.tls.unwrap().key_path, PathBuf::from("/etc/motmot/key.pem"));
        assert_eq!(config.federation.port, 9001);
        assert_eq!(
            config.federation.hosts.get("b.test"),
            Some(&"10.0.0.2:9001".parse().unwrap())
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/motmot.toml")).unwrap();
        assert!(config.domain.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn federation_tls_needs_ca() {
        let config: ServerConfig = toml::from_str(
            r#"
domain = "a.test"
[federation]
tls = true
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ca_path"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ServerConfig>("domian = \"a.test\"").is_err());
    }
}
