//! Durable storage of readings and anomaly records.
//!
//! ```sql
//! INSERT INTO sensorData(sensorId, valor, isDeleted, updatedAt, createdBy, updatedBy, nameSensor, codeOfProduct)
//! INSERT INTO anomaly(sensorDataId, createdBy, updatedBy)
//! ```
//!
//! The schema itself is managed outside this service.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions},
    query::Query,
    MySql, MySqlPool,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::reading::{Identifier, SensorReading};
use crate::config::database::DatabaseConfig;

/// Store-assigned id of a persisted reading.
pub type ReadingId = u64;

const INSERT_READING: &str = "INSERT INTO sensorData(sensorId, valor, isDeleted, updatedAt, createdBy, updatedBy, nameSensor, codeOfProduct) VALUES (?, ?, ?, ?, ?, ?, ?, ?)";
const INSERT_ANOMALY: &str = "INSERT INTO anomaly(sensorDataId, createdBy, updatedBy) VALUES (?, ?, ?)";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to store reading from sensor {sensor_id}: {source}")]
    Save {
        sensor_id: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to record anomaly for reading {reading_id}: {source}")]
    RecordAnomaly {
        reading_id: ReadingId,
        #[source]
        source: sqlx::Error,
    },
}

/// Storage used by the relay. Each call is attempted once; callers do not retry.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save(&self, reading: &SensorReading) -> Result<ReadingId, PersistenceError>;

    async fn record_anomaly(&self, reading_id: ReadingId) -> Result<(), PersistenceError>;
}

/// [`PersistenceGateway`] over a MySQL pool.
pub struct MySqlGateway {
    pool: MySqlPool,
    audit_user_id: i64,
}

impl MySqlGateway {
    pub fn new(pool: MySqlPool, audit_user_id: i64) -> Self {
        Self {
            pool,
            audit_user_id,
        }
    }

    /// Builds a lazily connecting pool: the service starts even when the
    /// database is down, and each write reports its own failure.
    pub fn from_config(config: &DatabaseConfig) -> Self {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database);
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy_with(options);

        info!(
            "MySQL pool configured for {}:{}/{} ({} connections)",
            config.host, config.port, config.database, config.max_connections
        );
        Self::new(pool, config.audit_user_id)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("MySQL pool closed");
    }
}

fn bind_identifier<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    id: &'q Identifier,
) -> Query<'q, MySql, MySqlArguments> {
    match id {
        Identifier::Int(id) => query.bind(*id),
        Identifier::Number(id) => match id.as_u64() {
            Some(id) => query.bind(id),
            None => query.bind(id.as_f64()),
        },
        Identifier::Text(id) => query.bind(id.as_str()),
    }
}

#[async_trait]
impl PersistenceGateway for MySqlGateway {
    async fn save(&self, reading: &SensorReading) -> Result<ReadingId, PersistenceError> {
        let query = bind_identifier(sqlx::query(INSERT_READING), &reading.sensor_id)
            .bind(reading.value)
            .bind(false)
            .bind(OffsetDateTime::now_utc())
            .bind(self.audit_user_id)
            .bind(self.audit_user_id)
            .bind(reading.sensor_name.as_str());
        let query = bind_identifier(query, &reading.product_code);

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|source| PersistenceError::Save {
                sensor_id: reading.sensor_id.to_string(),
                source,
            })?;

        Ok(result.last_insert_id())
    }

    async fn record_anomaly(&self, reading_id: ReadingId) -> Result<(), PersistenceError> {
        sqlx::query(INSERT_ANOMALY)
            .bind(reading_id)
            .bind(self.audit_user_id)
            .bind(self.audit_user_id)
            .execute(&self.pool)
            .await
            .map_err(|source| PersistenceError::RecordAnomaly { reading_id, source })?;
        Ok(())
    }
}
