use std::fmt;

use resol_vbus::chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};

const MINUTES_PER_DAY: i64 = 24 * 60;

/// A value extracted from a packet field, ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A scaled numeric value.
    Decimal(f64),

    /// A time-of-day field, anchored to the date it was received on.
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Interpret `minutes` as minutes since midnight on `date`.
    ///
    /// Values outside a single day wrap around.
    pub fn from_minutes_on(minutes: f64, date: NaiveDate) -> Value {
        let minutes = (minutes as i64).rem_euclid(MINUTES_PER_DAY);
        let hour = (minutes / 60) as u32;
        let minute = (minutes % 60) as u32;
        let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
        Value::Timestamp(date.and_time(time))
    }

    /// Interpret `minutes` as minutes since midnight today (local time).
    pub fn from_minutes(minutes: f64) -> Value {
        Value::from_minutes_on(minutes, Local::now().date_naive())
    }

    /// Return the decimal value, if this is one.
    pub fn as_decimal(&self) -> Option<f64> {
        match *self {
            Value::Decimal(value) => Some(value),
            Value::Timestamp(_) => None,
        }
    }

    /// Return the timestamp, if this is one.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match *self {
            Value::Decimal(_) => None,
            Value::Timestamp(timestamp) => Some(timestamp),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Decimal(value) => write!(f, "{}", value),
            Value::Timestamp(timestamp) => write!(f, "{}", timestamp.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}
