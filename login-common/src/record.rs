use std::fmt;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::mask::mask;

pub const DEVICE_ID: &str = "device_id";
pub const IP: &str = "ip";
pub const MASKED_DEVICE_ID: &str = "masked_device_id";
pub const MASKED_IP: &str = "masked_ip";
pub const CREATE_DATE: &str = "create_date";

/// Enumeration of errors that make a single login record unusable.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("message has no body")]
    EmptyBody,
    #[error("message body is not a JSON object: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("required field {field} is missing")]
    MissingField { field: &'static str },
    #[error("required field {field} is not a string")]
    InvalidField { field: &'static str },
}

/// A login event as produced upstream, before any masking.
///
/// Fields are kept in the order they arrived so unknown fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawLoginEvent(Map<String, Value>);

impl RawLoginEvent {
    pub fn from_json(body: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn device_id(&self) -> Option<&str> {
        self.str_field(DEVICE_ID)
    }

    pub fn ip(&self) -> Option<&str> {
        self.str_field(IP)
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for RawLoginEvent {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// A login event with `device_id` and `ip` replaced by their digests and stamped with the run date.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SanitizedLoginRecord(Map<String, Value>);

impl SanitizedLoginRecord {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn masked_device_id(&self) -> &str {
        self.0
            .get(MASKED_DEVICE_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn masked_ip(&self) -> &str {
        self.0
            .get(MASKED_IP)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn create_date(&self) -> &str {
        self.0
            .get(CREATE_DATE)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Render a single column the way it is stored: strings verbatim, other values as JSON text,
    /// nulls and absent fields as `None`.
    pub fn column_value(&self, column: &str) -> Option<String> {
        match self.0.get(column)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

type Clock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

/// Turns raw login events into sanitized records.
pub struct RecordTransformer {
    today: Clock,
}

impl Default for RecordTransformer {
    fn default() -> Self {
        Self {
            today: Box::new(|| Local::now().date_naive()),
        }
    }
}

impl fmt::Debug for RecordTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordTransformer").finish_non_exhaustive()
    }
}

impl RecordTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `today` instead of the process clock to stamp `create_date`.
    pub fn with_clock<F>(today: F) -> Self
    where
        F: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        Self {
            today: Box::new(today),
        }
    }

    /// Mask `device_id` and `ip`, drop the originals and stamp the record with today's date.
    /// Every other field is copied as is.
    pub fn transform(&self, raw: RawLoginEvent) -> Result<SanitizedLoginRecord, RecordError> {
        let mut fields = raw.0;

        let masked_device_id = mask(required_str(&fields, DEVICE_ID)?);
        let masked_ip = mask(required_str(&fields, IP)?);

        fields.shift_remove(DEVICE_ID);
        fields.shift_remove(IP);

        fields.insert(MASKED_DEVICE_ID.to_owned(), Value::String(masked_device_id));
        fields.insert(MASKED_IP.to_owned(), Value::String(masked_ip));
        fields.insert(
            CREATE_DATE.to_owned(),
            Value::String((self.today)().format("%Y-%m-%d").to_string()),
        );

        Ok(SanitizedLoginRecord(fields))
    }
}

fn required_str<'a>(
    fields: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, RecordError> {
    match fields.get(field) {
        None => Err(RecordError::MissingField { field }),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(RecordError::InvalidField { field }),
    }
}

/// The sanitized records accumulated by a single run, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunBatch {
    records: Vec<SanitizedLoginRecord>,
}

impl RunBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: SanitizedLoginRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SanitizedLoginRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SanitizedLoginRecord> {
        self.records.iter()
    }

    /// Every field name seen across the batch, in the order it was first seen.
    /// The set can differ between runs if upstream adds or drops fields.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for record in &self.records {
            for key in record.fields().keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

impl FromIterator<SanitizedLoginRecord> for RunBatch {
    fn from_iter<I: IntoIterator<Item = SanitizedLoginRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a RunBatch {
    type Item = &'a SanitizedLoginRecord;
    type IntoIter = std::slice::Iter<'a, SanitizedLoginRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
