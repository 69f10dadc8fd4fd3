use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct PushConfig {
    pub endpoint: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub postgres_dsn: String,
    pub redis_url: String,
    pub domain: String,
    pub admin_token: Option<String>,
    pub push: PushConfig,
    pub presence_ttl_seconds: i64,
    pub relay_ttl_seconds: i64,
    pub linking_ttl_seconds: i64,
    pub pending_fetch_limit: i64,
    pub connection_keepalive: u64,
}

/// Loads sealgram server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("SEALGRAM_BIND", map.remove("server.bind"))?)?;
    let tls_cert = required(override_env(
        "SEALGRAM_TLS_CERT",
        map.remove("server.tls_cert"),
    )?)?;
    let tls_key = required(override_env(
        "SEALGRAM_TLS_KEY",
        map.remove("server.tls_key"),
    )?)?;
    let postgres_dsn = required(override_env(
        "SEALGRAM_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let redis_url = required(override_env(
        "SEALGRAM_REDIS_URL",
        map.remove("storage.redis_url"),
    )?)?;
    let domain = required(override_env(
        "SEALGRAM_DOMAIN",
        map.remove("server.domain"),
    )?)?;
    let admin_token = override_env("SEALGRAM_ADMIN_TOKEN", map.remove("admin.token"))?;
    let push_endpoint = override_env("SEALGRAM_PUSH_ENDPOINT", map.remove("push.endpoint"))?;
    let push_auth_token = override_env("SEALGRAM_PUSH_TOKEN", map.remove("push.auth_token"))?;

    let presence_ttl = override_env("SEALGRAM_PRESENCE_TTL", map.remove("limits.presence_ttl"))?
        .unwrap_or_else(|| "30".to_string())
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid)?;
    let relay_ttl = override_env("SEALGRAM_RELAY_TTL", map.remove("limits.relay_ttl"))?
        .unwrap_or_else(|| "86400".to_string())
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid)?;
    let linking_ttl = override_env("SEALGRAM_LINKING_TTL", map.remove("limits.linking_ttl"))?
        .unwrap_or_else(|| "300".to_string())
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid)?;
    let pending_limit = override_env(
        "SEALGRAM_PENDING_LIMIT",
        map.remove("limits.pending_fetch_limit"),
    )?
    .unwrap_or_else(|| "128".to_string())
    .parse::<i64>()
    .map_err(|_| ConfigError::Invalid)?;
    let keepalive = override_env("SEALGRAM_KEEPALIVE", map.remove("server.keepalive"))?
        .unwrap_or_else(|| "60".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    if presence_ttl <= 0 || relay_ttl <= 0 || linking_ttl <= 0 || pending_limit <= 0 {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        bind,
        tls_cert,
        tls_key,
        postgres_dsn,
        redis_url,
        domain,
        admin_token,
        push: PushConfig {
            endpoint: push_endpoint,
            auth_token: push_auth_token,
        },
        presence_ttl_seconds: presence_ttl,
        relay_ttl_seconds: relay_ttl,
        linking_ttl_seconds: linking_ttl,
        pending_fetch_limit: pending_limit,
        connection_keepalive: keepalive,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("sealgram_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:8443\"\ntls_cert=\"cert.pem\"\ntls_key=\"key.pem\"\ndomain=\"example.org\"\nkeepalive=\"30\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8443");
        assert_eq!(config.presence_ttl_seconds, 30);
        assert_eq!(config.relay_ttl_seconds, 86400);
        assert_eq!(config.linking_ttl_seconds, 300);
        assert_eq!(config.pending_fetch_limit, 128);
        assert_eq!(config.connection_keepalive, 30);
        assert!(config.push.endpoint.is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn inline_comments_are_stripped() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("sealgram_test_config_comments.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"0.0.0.0:443\" # public\ntls_cert=\"cert.pem\"\ntls_key=\"key.pem\"\ndomain=\"example.org\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[limits]\nrelay_ttl=\"3600\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:443");
        assert_eq!(config.relay_ttl_seconds, 3600);
        fs::remove_file(path).unwrap();
    }
}
