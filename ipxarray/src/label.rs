use std::{cmp::Ordering, fmt};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// A coordinate label, or a label asked for in a selection
///
/// Integer and float labels compare by numeric value, so `Label::Int(3)` matches
/// `Label::Float(3.0)`.
///
#[derive(Clone, Debug)]
pub enum Label {
    Int(i64),
    Float(f64),
    Time(NaiveDateTime),
    Text(String),
}

const TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

impl Label {
    /// Numeric value, for integer and float labels
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Label::Int(value) => Some(*value as f64),
            Label::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<NaiveDateTime> {
        match self {
            Label::Time(time) => Some(*time),
            _ => None,
        }
    }

    pub fn is_time(&self) -> bool {
        matches!(self, Label::Time(_))
    }

    /// Parse an ISO 8601 style date or date-time, without time zone.
    ///
    pub fn parse_time(text: &str) -> Option<NaiveDateTime> {
        let text = text.trim().trim_end_matches('Z');
        TIME_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })
    }

    /// Interpret this label the way labels of `like` are interpreted.
    ///
    /// Text asked for against a time coordinate is read as a date.
    ///
    pub(crate) fn coerce_like(&self, like: &Label) -> Label {
        match (self, like) {
            (Label::Text(text), Label::Time(_)) => match Label::parse_time(text) {
                Some(time) => Label::Time(time),
                None => self.clone(),
            },
            _ => self.clone(),
        }
    }

    /// Order two labels of compatible kinds. `None` if they can't be compared.
    ///
    pub fn compare(&self, other: &Label) -> Option<Ordering> {
        match (self, other) {
            (Label::Int(a), Label::Int(b)) => Some(a.cmp(b)),
            (Label::Time(a), Label::Time(b)) => Some(a.cmp(b)),
            (Label::Text(a), Label::Text(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Absolute distance between two labels, in seconds for time labels.
    ///
    pub fn distance(&self, other: &Label) -> Option<f64> {
        match (self, other) {
            (Label::Time(a), Label::Time(b)) => {
                Some((*a - *b).num_milliseconds().abs() as f64 / 1000.0)
            }
            _ => Some((self.as_f64()? - other.as_f64()?).abs()),
        }
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Int(value) => write!(f, "{value}"),
            Label::Float(value) => write!(f, "{value}"),
            Label::Time(time) => write!(f, "{}", time.format("%Y-%m-%dT%H:%M:%S")),
            Label::Text(text) => write!(f, "{text:?}"),
        }
    }
}

impl From<i64> for Label {
    fn from(value: i64) -> Self {
        Label::Int(value)
    }
}

impl From<i32> for Label {
    fn from(value: i32) -> Self {
        Label::Int(value.into())
    }
}

impl From<f64> for Label {
    fn from(value: f64) -> Self {
        Label::Float(value)
    }
}

impl From<f32> for Label {
    fn from(value: f32) -> Self {
        Label::Float(value.into())
    }
}

impl From<NaiveDateTime> for Label {
    fn from(time: NaiveDateTime) -> Self {
        Label::Time(time)
    }
}

impl From<NaiveDate> for Label {
    fn from(date: NaiveDate) -> Self {
        Label::Time(date.and_time(NaiveTime::default()))
    }
}

impl From<&str> for Label {
    fn from(text: &str) -> Self {
        Label::Text(text.to_string())
    }
}

impl From<String> for Label {
    fn from(text: String) -> Self {
        Label::Text(text)
    }
}
