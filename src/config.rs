use mongodb::options::{ClientOptions, Credential, ServerAddress, Tls, TlsOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mongodb: MongoConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MongoConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_auth_database")]
    pub auth_database: String,
    #[serde(default)]
    pub replica_set: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// Rows between two checkpoints.
    #[serde(default = "default_update_bookmark_period")]
    pub update_bookmark_period: usize,
    /// Pending oplog changes held before a forced flush.
    #[serde(default = "default_max_update_buffer_length")]
    pub max_update_buffer_length: usize,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default)]
    pub include_schemas_in_destination_stream_name: bool,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            update_bookmark_period: default_update_bookmark_period(),
            max_update_buffer_length: default_max_update_buffer_length(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            include_schemas_in_destination_stream_name: false,
            state_file: None,
        }
    }
}

impl ReplicationConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("MONGO_CAPTURE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Driver options for the configured server. Credentials are passed
    /// as-is rather than embedded in a connection string.
    pub fn client_options(&self) -> ClientOptions {
        let credential = Credential::builder()
            .username(self.mongodb.user.clone())
            .password(self.mongodb.password.clone())
            .source(self.mongodb.auth_database.clone())
            .build();

        ClientOptions::builder()
            .hosts(vec![ServerAddress::Tcp {
                host: self.mongodb.host.clone(),
                port: Some(self.mongodb.port),
            }])
            .credential(credential)
            .repl_set_name(self.mongodb.replica_set.clone())
            .connect_timeout(Duration::from_secs(self.mongodb.connect_timeout_secs))
            .tls(self.mongodb.ssl.then(|| Tls::Enabled(TlsOptions::default())))
            .build()
    }
}

fn default_port() -> u16 {
    27017
}

fn default_auth_database() -> String {
    "admin".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_update_bookmark_period() -> usize {
    1000
}

fn default_max_update_buffer_length() -> usize {
    500
}

fn default_keepalive_interval_secs() -> u64 {
    600 // 10 minutes
}
