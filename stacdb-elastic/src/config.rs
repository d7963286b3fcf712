use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Connection settings, loaded from `ES_*` environment variables.
#[derive(Clone)]
pub struct ElasticConfig {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub verify_certs: bool,
    /// PEM bundle trusted in addition to the system roots (`CURL_CA_BUNDLE`).
    pub ca_bundle: Option<PathBuf>,
    pub api_key: Option<String>,
    /// Basic auth; only sent over https.
    pub credentials: Option<(String, String)>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ElasticConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("verify_certs", &self.verify_certs)
            .field("ca_bundle", &self.ca_bundle)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field(
                "credentials",
                &self.credentials.as_ref().map(|(user, _)| (user, "<redacted>")),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ElasticConfig {
    fn default() -> Self {
        ElasticConfig {
            host: "localhost".to_string(),
            port: 9200,
            use_ssl: true,
            verify_certs: true,
            ca_bundle: None,
            api_key: None,
            credentials: None,
            timeout: Duration::from_secs(60),
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

impl ElasticConfig {
    pub fn from_env() -> Self {
        let defaults = ElasticConfig::default();
        let credentials = match (non_empty("ES_USER"), non_empty("ES_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        let config = ElasticConfig {
            host: non_empty("ES_HOST").unwrap_or(defaults.host),
            port: env::var("ES_PORT")
                .ok()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            use_ssl: env_flag("ES_USE_SSL", defaults.use_ssl),
            verify_certs: env_flag("ES_VERIFY_CERTS", defaults.verify_certs),
            ca_bundle: non_empty("CURL_CA_BUNDLE").map(PathBuf::from),
            api_key: non_empty("ES_API_KEY"),
            credentials,
            timeout: env::var("ES_TIMEOUT")
                .ok()
                .and_then(|t| t.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        };
        if config.credentials.is_some() && !config.use_ssl {
            tracing::warn!("ES_USER/ES_PASS ignored because ES_USE_SSL is false");
        }
        tracing::info!("Loaded engine config: {:?}", config);
        config
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 9] = [
        "ES_HOST",
        "ES_PORT",
        "ES_USE_SSL",
        "ES_VERIFY_CERTS",
        "ES_API_KEY",
        "ES_USER",
        "ES_PASS",
        "ES_TIMEOUT",
        "CURL_CA_BUNDLE",
    ];

    fn clear() {
        for k in KEYS {
            env::remove_var(k);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        let c = ElasticConfig::from_env();
        assert_eq!(c.base_url(), "https://localhost:9200");
        assert!(c.verify_certs);
        assert!(c.api_key.is_none());
        assert_eq!(c.timeout, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear();
        env::set_var("ES_HOST", "es.internal");
        env::set_var("ES_PORT", "9201");
        env::set_var("ES_USE_SSL", "false");
        env::set_var("ES_API_KEY", "abc");
        env::set_var("ES_USER", "elastic");
        env::set_var("ES_PASS", "changeme");
        env::set_var("ES_TIMEOUT", "5");
        let c = ElasticConfig::from_env();
        assert_eq!(c.base_url(), "http://es.internal:9201");
        assert_eq!(c.api_key.as_deref(), Some("abc"));
        assert_eq!(c.timeout, Duration::from_secs(5));
        let debug = format!("{:?}", c);
        assert!(!debug.contains("changeme"));
        assert!(!debug.contains("abc"));
        clear();
    }

    #[test]
    #[serial]
    fn test_bad_port_falls_back() {
        clear();
        env::set_var("ES_PORT", "ninety");
        assert_eq!(ElasticConfig::from_env().port, 9200);
        clear();
    }
}
