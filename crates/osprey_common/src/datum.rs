use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// A single scalar value carried by a row-change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    /// Microseconds since Unix epoch.
    Timestamp(i64),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            Datum::Boolean(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int32(v) => Some(*v as f64),
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Cast to the declared column type. Lossless where possible; numeric
    /// narrowing that would overflow is an error, not a wrap.
    pub fn cast(&self, target: DataType) -> Result<Datum, String> {
        if self.is_null() {
            return Ok(Datum::Null);
        }
        match (self, target) {
            (Datum::Boolean(_), DataType::Boolean)
            | (Datum::Int32(_), DataType::Int32)
            | (Datum::Int64(_), DataType::Int64)
            | (Datum::Float64(_), DataType::Float64)
            | (Datum::Text(_), DataType::Text)
            | (Datum::Timestamp(_), DataType::Timestamp)
            | (Datum::Bytes(_), DataType::Bytes) => Ok(self.clone()),

            (Datum::Int32(v), DataType::Int64) => Ok(Datum::Int64(*v as i64)),
            (Datum::Int64(v), DataType::Int32) => i32::try_from(*v)
                .map(Datum::Int32)
                .map_err(|_| format!("int64 value {} overflows int32", v)),
            (Datum::Int32(v), DataType::Float64) => Ok(Datum::Float64(*v as f64)),
            (Datum::Int64(v), DataType::Float64) => Ok(Datum::Float64(*v as f64)),
            (Datum::Float64(v), DataType::Int64) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    Ok(Datum::Int64(*v as i64))
                } else {
                    Err(format!("float64 value {} is not an int64", v))
                }
            }
            (Datum::Int64(v), DataType::Timestamp) => Ok(Datum::Timestamp(*v)),
            (Datum::Timestamp(v), DataType::Int64) => Ok(Datum::Int64(*v)),
            (Datum::Text(s), DataType::Int64) => s
                .parse::<i64>()
                .map(Datum::Int64)
                .map_err(|_| format!("cannot parse {:?} as int64", s)),
            (Datum::Text(s), DataType::Float64) => s
                .parse::<f64>()
                .map(Datum::Float64)
                .map_err(|_| format!("cannot parse {:?} as float64", s)),
            (Datum::Text(s), DataType::Bytes) => Ok(Datum::Bytes(s.clone().into_bytes())),
            (Datum::Boolean(b), DataType::Int32) => Ok(Datum::Int32(*b as i32)),
            (Datum::Boolean(b), DataType::Int64) => Ok(Datum::Int64(*b as i64)),
            (v, t) => Err(format!("cannot cast {} to {}", v, t)),
        }
    }

    /// A typed placeholder injected for generated columns before their
    /// expression is evaluated, so earlier columns see a real value.
    pub fn placeholder(target: DataType) -> Datum {
        match target {
            DataType::Boolean => Datum::Boolean(false),
            DataType::Int32 => Datum::Int32(0),
            DataType::Int64 => Datum::Int64(0),
            DataType::Float64 => Datum::Float64(0.0),
            DataType::Text => Datum::Text(String::new()),
            DataType::Timestamp => Datum::Timestamp(0),
            DataType::Bytes => Datum::Bytes(Vec::new()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Timestamp(v) => write!(f, "ts:{}", v),
            Datum::Bytes(b) => write!(f, "0x{}", hex(b)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
