//! Configuration loading and validation.

use std::net::Ipv4Addr;
use std::path::Path;

use ppcp_proto::ident::MIN_PORT;
use ppcp_proto::nick::nick_from_name;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Endpoint configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Who we are.
    #[serde(default)]
    pub user: UserConfig,
    /// Sockets and the multicast group.
    #[serde(default)]
    pub net: NetConfig,
    /// Aging and resend intervals, in seconds (= ticks).
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// Local user identity.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Display name; the nick is derived from it.
    #[serde(default = "defaults::name")]
    pub name: String,
    /// Initial status message.
    #[serde(default)]
    pub status_message: String,
}

/// Network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    /// Protocol port: TCP listener, UDP bind, and the port peers must
    /// send datagrams from.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Discovery/broadcast group. Joined as a multicast group when it is
    /// a multicast address.
    #[serde(default = "defaults::multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Local bind address.
    #[serde(default = "defaults::bind")]
    pub bind: Ipv4Addr,
}

/// Timeouts, in ticks (nominally seconds).
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Idle age after which a connection is asked to close.
    #[serde(default = "defaults::conn_max_age")]
    pub conn_max_age: u64,
    /// How long a closing connection may linger before forcible teardown.
    #[serde(default = "defaults::closing_timeout")]
    pub closing_timeout: u64,
    /// Idle age after which a connection-less user is evicted.
    #[serde(default = "defaults::user_max_age")]
    pub user_max_age: u64,
    /// Eviction age for users currently offline.
    #[serde(default = "defaults::offline_user_max_age")]
    pub offline_user_max_age: u64,
    /// Interval between multicast re-announcements of our status.
    #[serde(default = "defaults::resend_interval")]
    pub resend_interval: u64,
}

mod defaults {
    use std::net::Ipv4Addr;

    pub fn name() -> String {
        "anonymous".to_string()
    }
    pub fn port() -> u16 {
        8167
    }
    pub fn multicast_group() -> Ipv4Addr {
        Ipv4Addr::new(227, 22, 16, 8)
    }
    pub fn bind() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }
    pub fn conn_max_age() -> u64 {
        120
    }
    pub fn closing_timeout() -> u64 {
        10
    }
    pub fn user_max_age() -> u64 {
        300
    }
    pub fn offline_user_max_age() -> u64 {
        600
    }
    pub fn resend_interval() -> u64 {
        60
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: defaults::name(),
            status_message: String::new(),
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            multicast_group: defaults::multicast_group(),
            bind: defaults::bind(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            conn_max_age: defaults::conn_max_age(),
            closing_timeout: defaults::closing_timeout(),
            user_max_age: defaults::user_max_age(),
            offline_user_max_age: defaults::offline_user_max_age(),
            resend_interval: defaults::resend_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints after parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net.port < MIN_PORT {
            return Err(ConfigError::Invalid(format!(
                "net.port must be {MIN_PORT}-65535, got {}",
                self.net.port
            )));
        }
        if nick_from_name(&self.user.name).is_empty() {
            return Err(ConfigError::Invalid("user.name must not be empty".into()));
        }
        Ok(())
    }

    /// Our canonical nick, derived from the configured display name.
    pub fn nick(&self) -> String {
        nick_from_name(&self.user.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.net.port, 8167);
        assert_eq!(config.nick(), "anonymous");
        assert!(config.net.multicast_group.is_multicast());
    }

    #[test]
    fn test_load_and_derive_nick() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[user]
name = "Bob Dobbs"
status_message = "slack"

[net]
port = 9000
"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.user.name, "Bob Dobbs");
        assert_eq!(config.nick(), "bob_dobbs");
        assert_eq!(config.net.port, 9000);
        assert_eq!(config.timeouts.conn_max_age, 120);
    }

    #[test]
    fn test_rejects_privileged_port() {
        let config: Config = toml::from_str("[net]\nport = 80\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
