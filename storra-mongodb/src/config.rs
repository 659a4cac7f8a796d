//! Connection settings for the MongoDB backend.

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::connection::RetryPolicy;

/// Settings for the MongoDB backend. Every field has a default, so a partial
/// configuration file is merged over them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoDbConfig {
    pub host: String,
    pub port: u16,
    pub pool_size: u32,
    /// How many times a request polls a connection that is still being established.
    pub connection_max_retries: u32,
    /// Milliseconds between two polls.
    pub connection_time_between_retries: u64,
    pub database: String,
}

impl MongoDbConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "mongodb://{}:{}/?maxPoolSize={}",
            self.host, self.port, self.pool_size
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.connection_max_retries,
            interval: Duration::from_millis(self.connection_time_between_retries),
        }
    }
}

impl Default for MongoDbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
            pool_size: 10,
            connection_max_retries: 20,
            connection_time_between_retries: 50,
            database: "storra".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MongoDbConfig::default();
        assert_eq!(config.connection_string(), "mongodb://localhost:27017/?maxPoolSize=10");
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.database, "storra");
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: MongoDbConfig = serde_json::from_str(r#"{ "port": 27018, "database": "test" }"#).unwrap();
        assert_eq!(config.port, 27018);
        assert_eq!(config.database, "test");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.connection_max_retries, 20);
    }
}
