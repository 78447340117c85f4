use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub postgres: PostgresConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    /// Full connection string. Takes precedence over the individual fields.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Schema-qualified name of the outbound event queue table.
    #[serde(default = "default_queue_table")]
    pub queue_table: String,
    /// Channel the capture triggers NOTIFY on.
    #[serde(default = "default_notify_channel")]
    pub notify_channel: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    /// Overrides the database name as topic namespace. An empty string
    /// disables the namespace entirely.
    #[serde(default)]
    pub topic_namespace: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default)]
    pub security_protocol: Option<String>,
    #[serde(default)]
    pub sasl_mechanism: Option<String>,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    /// Log intended publishes instead of sending them.
    #[serde(default)]
    pub dry_run: bool,
    /// Run the queue migrations and trigger definitions before starting.
    #[serde(default)]
    pub setup: bool,
    #[serde(default = "default_sql_dir")]
    pub sql_dir: PathBuf,
}

impl Config {
    /// Loads configuration from an optional TOML file, then `PG_RELAY_*`
    /// environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("PG_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.postgres.queue_table.trim().is_empty() {
            return Err(Error::Config("postgres.queue_table must not be empty".to_string()));
        }
        if self.postgres.notify_channel.trim().is_empty() {
            return Err(Error::Config("postgres.notify_channel must not be empty".to_string()));
        }
        self.postgres_connection()?;
        if self.relay.keepalive_interval_secs == 0 {
            return Err(Error::Config("relay.keepalive_interval_secs must be positive".to_string()));
        }
        if self.kafka.metadata_timeout_secs == 0 {
            return Err(Error::Config("kafka.metadata_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Connection settings for both the queue and the listener connection.
    pub fn postgres_connection(&self) -> Result<tokio_postgres::Config> {
        if let Some(url) = &self.postgres.url {
            return url
                .parse::<tokio_postgres::Config>()
                .map_err(|e| Error::Config(format!("invalid postgres.url: {}", e)));
        }

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.postgres.host)
            .port(self.postgres.port)
            .dbname(&self.postgres.database)
            .user(&self.postgres.username)
            .connect_timeout(Duration::from_secs(self.postgres.connect_timeout_secs));
        if !self.postgres.password.is_empty() {
            pg_config.password(&self.postgres.password);
        }
        Ok(pg_config)
    }

    /// The configured namespace override, falling back to the source database name.
    pub fn topic_namespace(&self) -> String {
        if let Some(namespace) = &self.kafka.topic_namespace {
            return namespace.clone();
        }
        self.postgres_connection()
            .ok()
            .and_then(|c| c.get_dbname().map(str::to_string))
            .unwrap_or_else(|| self.postgres.database.clone())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.relay.keepalive_interval_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.flush_timeout_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka.metadata_timeout_secs)
    }
}

/// Topic for events of `table_name`: `<namespace>.<table_name>`, or just the
/// table name when the namespace is empty.
pub fn topic_name(namespace: &str, table_name: &str) -> String {
    if namespace.is_empty() {
        table_name.to_string()
    } else {
        format!("{}.{}", namespace, table_name)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            queue_table: default_queue_table(),
            notify_channel: default_notify_channel(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval_secs(),
            flush_timeout_secs: default_flush_timeout_secs(),
            dry_run: false,
            setup: false,
            sql_dir: default_sql_dir(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_username() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_queue_table() -> String {
    "pg2kafka.outbound_event_queue".to_string()
}

fn default_notify_channel() -> String {
    "outbound_event_queue".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_metadata_timeout_secs() -> u64 {
    30
}

fn default_keepalive_interval_secs() -> u64 {
    90
}

fn default_flush_timeout_secs() -> u64 {
    10
}

fn default_sql_dir() -> PathBuf {
    PathBuf::from("./sql")
}
