//! Module that contains the sensor reading record and the payloads accepted by the HTTP API.
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// Keys that every create payload has to carry, even if the value is `null`.
pub const REQUIRED_FIELDS: [&str; 12] = [
    "date",
    "time",
    "time_zone_offset",
    "coordinates",
    "temperature_water",
    "temperature_air",
    "humidity",
    "wind_speed",
    "wind_direction",
    "precipitation",
    "haze",
    "becquerel",
];

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y%m%d %H:%M %:z",
    "%Y%m%d %H:%M:%S %:z",
    "%Y-%m-%d %H:%M %:z",
    "%Y-%m-%d %H:%M:%S %:z",
];

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
/// Optional measurements of a reading. `None` means the value was not measured.
pub struct Measurements {
    /// Water temperature in celsius.
    pub temperature_water: Option<f64>,
    /// Air temperature in celsius.
    pub temperature_air: Option<f64>,
    /// Relative humidity in percent.
    pub humidity: Option<f64>,
    /// Wind speed.
    pub wind_speed: Option<f64>,
    /// Wind direction in degrees.
    pub wind_direction: Option<f64>,
    /// Precipitation amount.
    pub precipitation: Option<f64>,
    /// Descriptive haze condition.
    pub haze: Option<String>,
    /// Radiation level in becquerel.
    pub becquerel: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
/// Struct representing environmental data recorded at a location and a specific timestamp.
pub struct SensorReading {
    /// Identifier assigned by the storage on insert.
    pub id: i32,
    /// Timestamp the reading was taken, in the offset it was reported with.
    pub timestamp: DateTime<FixedOffset>,
    /// Free-form location of the reading.
    pub coordinates: String,
    pub measurements: Measurements,
}

impl SensorReading {
    /// Calendar date of the reading in its own offset.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A validated reading that has not been stored yet.
pub struct NewReading {
    pub timestamp: DateTime<FixedOffset>,
    pub coordinates: String,
    pub measurements: Measurements,
}

impl NewReading {
    pub fn with_id(self, id: i32) -> SensorReading {
        SensorReading {
            id,
            timestamp: self.timestamp,
            coordinates: self.coordinates,
            measurements: self.measurements,
        }
    }
}

#[derive(Deserialize, Debug)]
struct CreatePayload {
    #[serde(deserialize_with = "text_or_number")]
    date: String,
    #[serde(deserialize_with = "text_or_number")]
    time: String,
    time_zone_offset: String,
    coordinates: String,
    #[serde(flatten)]
    measurements: Measurements,
}

/// Parses the body of a create request.
///
/// All keys in [`REQUIRED_FIELDS`] must be present. Their values are then checked for type and the
/// date, time and offset are combined into a single timestamp.
///
/// # Errors
///
/// * [`ApiError::Validation`] - The body is not a JSON object, misses a key or a value has the wrong type.
///
/// * [`ApiError::Format`] - Date, time and offset do not form a valid timestamp.
pub fn parse_create(body: &[u8]) -> Result<NewReading, ApiError> {
    let object: Map<String, Value> = serde_json::from_slice(body)
        .map_err(|_| ApiError::Validation(String::from("Missing required fields")))?;

    if let Some(missing) = REQUIRED_FIELDS.iter().find(|key| !object.contains_key(**key)) {
        log::debug!(target: "sensord::http", "Create payload is missing the key \'{}\'", missing);
        return Err(ApiError::Validation(String::from("Missing required fields")));
    }

    let payload: CreatePayload = serde_json::from_value(Value::Object(object))
        .map_err(|err| ApiError::Validation(format!("Invalid field value: {}", err)))?;

    let timestamp = parse_timestamp(&payload.date, &payload.time, &payload.time_zone_offset)?;

    Ok(NewReading {
        timestamp,
        coordinates: payload.coordinates,
        measurements: payload.measurements,
    })
}

/// Combines a date (`YYYYMMDD` or `YYYY-MM-DD`), a time (`hh:mm` or `hh:mm:ss`) and an offset
/// (`+hh:mm`) into a timestamp.
pub fn parse_timestamp(date: &str, time: &str, offset: &str) -> Result<DateTime<FixedOffset>, ApiError> {
    let combined = format!("{} {} {}", date.trim(), time.trim(), offset.trim());

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(&combined, format).ok())
        .ok_or_else(|| {
            ApiError::Format(String::from(
                "Invalid date/time format. Date should be YYYYMMDD and Time should be hh:mm.",
            ))
        })
}

/// Parses the date used in the `/api/sensor-data/{date}` routes. Only exactly eight digits are accepted.
pub fn parse_path_date(date: &str) -> Result<NaiveDate, ApiError> {
    let invalid = || ApiError::Format(String::from("Invalid date format. Expected YYYYMMDD."));

    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())
}

/// Accepts a string or a bare JSON number such as `20240101` and yields its text.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!("expected a string or a number, found {}", other))),
    }
}

/// Writes a timestamp in RFC 3339 form, keeping a `+00:00` offset instead of `Z`.
fn rfc3339<S>(timestamp: &DateTime<FixedOffset>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&timestamp.to_rfc3339())
}

/// Wraps a present value in `Some`, so a key set to `null` can be told apart from a missing key.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
/// Partial update of a reading.
///
/// The outer `Option` tells whether the key was sent, the inner one carries an explicit `null`.
pub struct ReadingPatch {
    #[serde(default, deserialize_with = "present")]
    pub coordinates: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub temperature_water: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub temperature_air: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub humidity: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub wind_speed: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub wind_direction: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub precipitation: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub haze: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub becquerel: Option<Option<f64>>,
}

impl ReadingPatch {
    /// Parses the body of an update request. An empty body is an empty patch.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default());
        }

        let object: Map<String, Value> = serde_json::from_slice(body)
            .map_err(|err| ApiError::Validation(format!("Invalid update payload: {}", err)))?;

        serde_json::from_value(Value::Object(object))
            .map_err(|err| ApiError::Validation(format!("Invalid update payload: {}", err)))
    }

    /// Overwrites every field of `reading` that is set in the patch.
    pub fn apply_to(self, reading: &mut SensorReading) {
        let m = &mut reading.measurements;

        if let Some(coordinates) = self.coordinates {
            reading.coordinates = coordinates;
        }
        if let Some(value) = self.temperature_water {
            m.temperature_water = value;
        }
        if let Some(value) = self.temperature_air {
            m.temperature_air = value;
        }
        if let Some(value) = self.humidity {
            m.humidity = value;
        }
        if let Some(value) = self.wind_speed {
            m.wind_speed = value;
        }
        if let Some(value) = self.wind_direction {
            m.wind_direction = value;
        }
        if let Some(value) = self.precipitation {
            m.precipitation = value;
        }
        if let Some(value) = self.haze {
            m.haze = value;
        }
        if let Some(value) = self.becquerel {
            m.becquerel = value;
        }
    }
}

#[derive(Serialize, Debug)]
/// JSON representation of a stored reading.
pub struct ReadingView {
    pub id: i32,
    pub date: NaiveDate,
    #[serde(serialize_with = "rfc3339")]
    pub timestamp: DateTime<FixedOffset>,
    pub coordinates: String,
    #[serde(flatten)]
    pub measurements: Measurements,
}

impl From<SensorReading> for ReadingView {
    fn from(reading: SensorReading) -> Self {
        ReadingView {
            id: reading.id,
            date: reading.date(),
            timestamp: reading.timestamp,
            coordinates: reading.coordinates,
            measurements: reading.measurements,
        }
    }
}
