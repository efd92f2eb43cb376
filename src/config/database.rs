//! `[database]` section: MySQL connection and audit identifiers.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    #[validate(length(min = 1, max = 255, message = "Database host must not be empty"))]
    pub host: String,

    #[validate(range(min = 1, message = "Database port must be between 1 and 65535"))]
    pub port: u16,

    #[validate(length(min = 1, message = "Database user must not be empty"))]
    pub user: String,

    pub password: Option<String>,

    #[validate(length(min = 1, message = "Database name must not be empty"))]
    pub database: String,

    #[validate(range(min = 1, max = 100, message = "Pool size must be between 1 and 100"))]
    pub max_connections: u32,

    /// Seconds to wait for a free pooled connection.
    #[validate(range(min = 1, max = 300, message = "Acquire timeout must be between 1 and 300 seconds"))]
    pub acquire_timeout_secs: u64,

    /// Written to `createdBy`/`updatedBy` on every inserted row.
    pub audit_user_id: i64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            database: "sensors".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 5,
            audit_user_id: 1,
        }
    }
}
