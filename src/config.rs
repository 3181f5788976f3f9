//! Configuration for the gateway.
//!
//! Everything is fed from environment variables once at boot and immutable
//! thereafter. `.env` files are honored via `dotenvy` before this module is
//! consulted.
//!
//! # Variables
//!
//! - `KAFKA_BROKERS`: CSV broker list (default `localhost:9092`)
//! - `KAFKA_SSL`: enable TLS toward the brokers
//! - `KAFKA_SASL_ENABLED` + `KAFKA_API_KEY` + `KAFKA_API_SECRET`: SASL/PLAIN
//! - `SCHEMA_REGISTRY_URL` + `SCHEMA_REGISTRY_KEY` + `SCHEMA_REGISTRY_SECRET`
//! - `POSTGRES_HOST`, `POSTGRES_PORT`, `POSTGRES_DB`, `POSTGRES_USER`,
//!   `POSTGRES_PASSWORD`
//! - `JWT_SECRET`: WebSocket/HTTP token verification
//! - `PORT`: HTTP listen port (default 3000)

use rdkafka::config::ClientConfig;
use std::env;
use thiserror::Error;
use tracing::warn;

/// Configuration errors raised at boot. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },
}

/// Root configuration, assembled once in `main`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub kafka: KafkaConfig,
    pub registry: RegistryConfig,
    pub postgres: PostgresConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// Broker connection settings shared by the producer and the consumer.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub ssl: bool,
    pub sasl: Option<SaslConfig>,
}

/// SASL/PLAIN credentials (the only mechanism the backend cluster accepts).
#[derive(Debug, Clone)]
pub struct SaslConfig {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

fn default_port() -> u16 {
    3000
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_registry_url() -> String {
    "http://localhost:8081".to_string()
}

fn env_flag(var: &'static str) -> bool {
    matches!(
        env::var(var).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingVar(var))
}

impl GatewayConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
                var: "PORT",
                value: raw,
            })?,
            Err(_) => default_port(),
        };

        let brokers = match env::var("KAFKA_BROKERS") {
            Ok(raw) => raw
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect(),
            Err(_) => default_brokers(),
        };

        let sasl = if env_flag("KAFKA_SASL_ENABLED") {
            Some(SaslConfig {
                mechanism: "PLAIN".to_string(),
                username: required("KAFKA_API_KEY")?,
                password: required("KAFKA_API_SECRET")?,
            })
        } else {
            None
        };

        let pg_port = match env::var("POSTGRES_PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
                var: "POSTGRES_PORT",
                value: raw,
            })?,
            Err(_) => 5432,
        };

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set, defaulting to 'dev-secret'. DO NOT USE IN PRODUCTION.");
            "dev-secret".to_string()
        });

        Ok(Self {
            server: ServerConfig { port },
            kafka: KafkaConfig {
                brokers,
                ssl: env_flag("KAFKA_SSL"),
                sasl,
            },
            registry: RegistryConfig {
                url: env::var("SCHEMA_REGISTRY_URL").unwrap_or_else(|_| default_registry_url()),
                username: env::var("SCHEMA_REGISTRY_KEY").ok(),
                password: env::var("SCHEMA_REGISTRY_SECRET").ok(),
            },
            postgres: PostgresConfig {
                host: env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: pg_port,
                database: env::var("POSTGRES_DB").unwrap_or_else(|_| "velivolant".to_string()),
                user: env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: env::var("POSTGRES_PASSWORD").unwrap_or_default(),
            },
            auth: AuthConfig { jwt_secret },
        })
    }
}

impl KafkaConfig {
    /// Comma-joined broker list in the form librdkafka expects.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// The `security.protocol` implied by the ssl/sasl combination.
    pub fn security_protocol(&self) -> &'static str {
        match (self.ssl, self.sasl.is_some()) {
            (true, true) => "SASL_SSL",
            (true, false) => "SSL",
            (false, true) => "SASL_PLAINTEXT",
            (false, false) => "PLAINTEXT",
        }
    }

    /// Apply the shared broker settings to an rdkafka client config.
    pub fn apply(&self, client: &mut ClientConfig) {
        client.set("bootstrap.servers", self.bootstrap_servers());
        client.set("security.protocol", self.security_protocol());
        if let Some(sasl) = &self.sasl {
            client.set("sasl.mechanisms", &sasl.mechanism);
            client.set("sasl.username", &sasl.username);
            client.set("sasl.password", &sasl.password);
        }
    }
}

impl PostgresConfig {
    /// Connection URL for the sqlx Postgres driver.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Process environment is shared; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn defaults_without_environment() {
        let _guard = env_guard();
        env::remove_var("PORT");
        env::remove_var("KAFKA_BROKERS");
        env::remove_var("KAFKA_SASL_ENABLED");

        let config = GatewayConfig::load().unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.kafka.brokers, vec!["localhost:9092".to_string()]);
        assert!(config.kafka.sasl.is_none());
        assert_eq!(config.kafka.security_protocol(), "PLAINTEXT");
    }

    #[test]
    fn broker_csv_is_split_and_trimmed() {
        let _guard = env_guard();
        env::set_var("KAFKA_BROKERS", "b1:9092, b2:9092 ,");
        let config = GatewayConfig::load().unwrap();
        assert_eq!(
            config.kafka.brokers,
            vec!["b1:9092".to_string(), "b2:9092".to_string()]
        );
        assert_eq!(config.kafka.bootstrap_servers(), "b1:9092,b2:9092");
        env::remove_var("KAFKA_BROKERS");
    }

    #[test]
    fn sasl_requires_credentials() {
        let _guard = env_guard();
        env::set_var("KAFKA_SASL_ENABLED", "true");
        env::remove_var("KAFKA_API_KEY");
        env::remove_var("KAFKA_API_SECRET");

        let err = GatewayConfig::load().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("KAFKA_API_KEY")));

        env::set_var("KAFKA_API_KEY", "key");
        env::set_var("KAFKA_API_SECRET", "secret");
        let config = GatewayConfig::load().unwrap();
        let sasl = config.kafka.sasl.unwrap();
        assert_eq!(sasl.mechanism, "PLAIN");
        assert_eq!(sasl.username, "key");

        env::remove_var("KAFKA_SASL_ENABLED");
        env::remove_var("KAFKA_API_KEY");
        env::remove_var("KAFKA_API_SECRET");
    }

    #[test]
    fn postgres_url_shape() {
        let pg = PostgresConfig {
            host: "db".into(),
            port: 5433,
            database: "velivolant".into(),
            user: "gateway".into(),
            password: "pw".into(),
        };
        assert_eq!(pg.url(), "postgres://gateway:pw@db:5433/velivolant");
    }
}
