//! Wire model of a sensor reading.
//!
//! Inbound payloads look like
//!
//! ```json
//! { "sensorId": 7, "valor": 200, "nameSensor": "modulo de sensor de luz fotoresistencia ldr", "codeOfProduct": 3 }
//! ```
//!
//! Unknown fields are kept and re-emitted on the outbound message, which adds
//! `anomalie` and `createdAt`. `valor` is re-emitted in the JSON type it
//! arrived with.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use time::{macros::format_description, OffsetDateTime};

/// Fields added to every outbound message. Inbound copies are discarded.
const OUTBOUND_FIELDS: [&str; 2] = ["anomalie", "createdAt"];

/// Sensor or product identifier, kept in the JSON type it arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Int(i64),
    /// Fractional, or beyond the `i64` range.
    Number(Number),
    Text(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Int(id) => write!(f, "{id}"),
            Identifier::Number(id) => write!(f, "{id}"),
            Identifier::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawReading")]
pub struct SensorReading {
    #[serde(rename = "sensorId")]
    pub sensor_id: Identifier,

    /// Measurement as a float, used for classification and storage.
    #[serde(skip)]
    pub value: f64,

    /// `valor` exactly as received: a number or a numeric string.
    #[serde(rename = "valor")]
    pub raw_value: Value,

    /// Sensor type, the classification key.
    #[serde(rename = "nameSensor")]
    pub sensor_name: String,

    #[serde(rename = "codeOfProduct")]
    pub product_code: Identifier,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SensorReading {
    /// Parses a UTF-8 JSON payload.
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        let mut reading: SensorReading = serde_json::from_slice(payload)?;
        for field in OUTBOUND_FIELDS {
            reading.extra.remove(field);
        }
        Ok(reading)
    }
}

#[derive(Deserialize)]
struct RawReading {
    #[serde(rename = "sensorId")]
    sensor_id: Identifier,
    valor: Value,
    #[serde(rename = "nameSensor")]
    sensor_name: String,
    #[serde(rename = "codeOfProduct")]
    product_code: Identifier,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawReading> for SensorReading {
    type Error = String;

    fn try_from(raw: RawReading) -> Result<Self, Self::Error> {
        Ok(Self {
            sensor_id: raw.sensor_id,
            value: measurement(&raw.valor)?,
            raw_value: raw.valor,
            sensor_name: raw.sensor_name,
            product_code: raw.product_code,
            extra: raw.extra,
        })
    }
}

/// Accepts a JSON number or a numeric string; rejects non-finite values.
fn measurement(valor: &Value) -> Result<f64, String> {
    let value = match valor {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("valor is out of range: {n}"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("valor is not numeric: {s:?}"))?,
        other => return Err(format!("valor must be a number or numeric string, got {other}")),
    };
    if !value.is_finite() {
        return Err("valor must be finite".to_string());
    }
    Ok(value)
}

/// Message published to the durable queue.
#[derive(Debug, Serialize)]
pub struct OutboundReading<'a> {
    #[serde(flatten)]
    pub reading: &'a SensorReading,

    pub anomalie: bool,

    #[serde(rename = "createdAt", serialize_with = "serialize_timestamp")]
    pub created_at: OffsetDateTime,
}

impl<'a> OutboundReading<'a> {
    pub fn new(reading: &'a SensorReading, anomalie: bool, created_at: OffsetDateTime) -> Self {
        Self {
            reading,
            anomalie,
            created_at,
        }
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// `2024-05-01T12:30:00.123Z`: UTC with millisecond precision.
fn serialize_timestamp<S>(timestamp: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");
    let formatted = timestamp
        .to_offset(time::UtcOffset::UTC)
        .format(&format)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}
