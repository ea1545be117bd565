use chrono::NaiveDateTime;
use serde_json::{Map, Value};

use crate::window::GroupKey;
use crate::EventTime;

/// Wire format of `InvoiceDate`, e.g. `12/1/2010 8:26`. Interpreted as UTC.
pub const INVOICE_DATE_FORMAT: &str = "%m/%d/%Y %H:%M";

/// One invoice line as published on the bus. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRecord {
    pub invoice_no: String,
    pub stock_code: Option<String>,
    pub description: Option<String>,
    pub quantity: i64,
    pub invoice_date: EventTime,
    pub unit_price: f64,
    pub customer_id: String,
    pub country: String,
}

/// Why a payload could not become an [`InvoiceRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("malformed json: {0}")]
    MalformedJson(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {0} has the wrong type")]
    TypeMismatch(&'static str),
    #[error("unparsable timestamp {0:?}")]
    UnparsableTimestamp(String),
}

impl Rejection {
    /// Stable label used for counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::MalformedJson(_) => "malformed_json",
            Rejection::MissingField(_) => "missing_field",
            Rejection::TypeMismatch(_) => "type_mismatch",
            Rejection::UnparsableTimestamp(_) => "unparsable_timestamp",
        }
    }
}

impl InvoiceRecord {
    /// Decodes a JSON object payload, validating all eight schema fields.
    ///
    /// `StockCode` and `Description` are informational and may be absent or null;
    /// every other field is required and a null counts as missing.
    pub fn decode(payload: &[u8]) -> Result<Self, Rejection> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| Rejection::MalformedJson(e.to_string()))?;
        let obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(Rejection::MalformedJson(format!(
                    "expected an object, found {}",
                    json_kind(&other)
                )))
            }
        };

        let invoice_no = required_str(&obj, "InvoiceNo")?;
        let stock_code = optional_str(&obj, "StockCode")?;
        let description = optional_str(&obj, "Description")?;
        let quantity = required_int(&obj, "Quantity")?;
        let invoice_date = parse_invoice_date(&required_str(&obj, "InvoiceDate")?)?;
        let unit_price = required_float(&obj, "UnitPrice")?;
        let customer_id = required_str(&obj, "CustomerID")?;
        let country = required_str(&obj, "Country")?;

        Ok(Self {
            invoice_no,
            stock_code,
            description,
            quantity,
            invoice_date,
            unit_price,
            customer_id,
            country,
        })
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            invoice_no: self.invoice_no.clone(),
            customer_id: self.customer_id.clone(),
            country: self.country.clone(),
        }
    }

    /// Quantity × UnitPrice.
    pub fn line_total(&self) -> f64 {
        self.quantity as f64 * self.unit_price
    }
}

pub fn parse_invoice_date(s: &str) -> Result<EventTime, Rejection> {
    NaiveDateTime::parse_from_str(s.trim(), INVOICE_DATE_FORMAT)
        .map(|naive| EventTime::from_datetime(naive.and_utc()))
        .map_err(|_| Rejection::UnparsableTimestamp(s.to_string()))
}

fn present<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Option<&'a Value> {
    obj.get(name).filter(|v| !v.is_null())
}

fn required_str(obj: &Map<String, Value>, name: &'static str) -> Result<String, Rejection> {
    match present(obj, name) {
        None => Err(Rejection::MissingField(name)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(Rejection::TypeMismatch(name)),
    }
}

fn optional_str(obj: &Map<String, Value>, name: &'static str) -> Result<Option<String>, Rejection> {
    match present(obj, name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Rejection::TypeMismatch(name)),
    }
}

fn required_int(obj: &Map<String, Value>, name: &'static str) -> Result<i64, Rejection> {
    match present(obj, name) {
        None => Err(Rejection::MissingField(name)),
        // 32-bit, like the producer's schema
        Some(Value::Number(n)) => n
            .as_i64()
            .filter(|v| i32::try_from(*v).is_ok())
            .ok_or(Rejection::TypeMismatch(name)),
        Some(_) => Err(Rejection::TypeMismatch(name)),
    }
}

fn required_float(obj: &Map<String, Value>, name: &'static str) -> Result<f64, Rejection> {
    match present(obj, name) {
        None => Err(Rejection::MissingField(name)),
        Some(Value::Number(n)) => n.as_f64().ok_or(Rejection::TypeMismatch(name)),
        Some(_) => Err(Rejection::TypeMismatch(name)),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
