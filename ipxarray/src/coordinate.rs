use std::cmp::Ordering;

use chrono::{Duration, NaiveDateTime};
use serde_json::Value;

use crate::{
    label::Label,
    metadata::{Attributes, DataType},
    selection::DimSelection,
};

const STANDARD_CALENDARS: [&str; 3] = ["standard", "gregorian", "proleptic_gregorian"];

/// The labels along one dimension
///
#[derive(Clone, Debug)]
pub struct Coordinate {
    name: String,
    labels: Vec<Label>,
    attrs: Attributes,
}

impl Coordinate {
    pub fn new<S, L>(name: S, labels: Vec<L>) -> Self
    where
        S: Into<String>,
        L: Into<Label>,
    {
        Self {
            name: name.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            attrs: Attributes::new(),
        }
    }

    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    /// Build a coordinate from decoded array values.
    ///
    /// Values with CF style time units (`"days since 2000-01-01"`) in a standard calendar become
    /// time labels. Otherwise integer data types give integer labels and the rest float labels.
    ///
    pub fn from_values<S: Into<String>>(
        name: S,
        values: &[f64],
        data_type: DataType,
        attrs: Attributes,
    ) -> Self {
        let labels = match decode_cf_time(values, &attrs) {
            Some(times) => times.into_iter().map(Label::Time).collect(),
            None if data_type.is_float() => values.iter().copied().map(Label::Float).collect(),
            None => values.iter().map(|&value| Label::Int(value as i64)).collect(),
        };

        Self {
            name: name.into(),
            labels,
            attrs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Label> {
        self.labels.get(index)
    }

    pub fn is_time(&self) -> bool {
        self.labels.first().map(Label::is_time).unwrap_or(false)
    }

    /// Whether labels never decrease from one to the next
    ///
    pub fn is_ascending(&self) -> bool {
        self.labels.windows(2).all(|pair| {
            matches!(
                pair[0].compare(&pair[1]),
                Some(Ordering::Less | Ordering::Equal)
            )
        })
    }

    /// The part of this coordinate picked out by `selection`.
    ///
    /// `None` if the selection is a single index, which removes the dimension.
    ///
    pub(crate) fn select(&self, selection: &DimSelection) -> Option<Self> {
        if selection.is_scalar() {
            return None;
        }

        Some(Self {
            name: self.name.clone(),
            labels: selection
                .positions()
                .filter_map(|i| self.labels.get(i).cloned())
                .collect(),
            attrs: self.attrs.clone(),
        })
    }

    /// Whether two coordinates hold the same labels, in the same order
    ///
    pub fn same_labels(&self, other: &Coordinate) -> bool {
        self.labels == other.labels
    }

    /// Concatenate two coordinates along their dimension
    ///
    pub(crate) fn append(&self, other: &Coordinate) -> Self {
        let mut labels = self.labels.clone();
        labels.extend(other.labels.iter().cloned());

        Self {
            name: self.name.clone(),
            labels,
            attrs: self.attrs.clone(),
        }
    }
}

fn unit_seconds(unit: &str) -> Option<f64> {
    match unit {
        "seconds" | "second" | "secs" | "sec" | "s" => Some(1.0),
        "minutes" | "minute" | "mins" | "min" => Some(60.0),
        "hours" | "hour" | "hrs" | "hr" | "h" => Some(3600.0),
        "days" | "day" | "d" => Some(86400.0),
        _ => None,
    }
}

fn decode_cf_time(values: &[f64], attrs: &Attributes) -> Option<Vec<NaiveDateTime>> {
    let units = attrs.get("units").and_then(Value::as_str)?;
    if let Some(calendar) = attrs.get("calendar").and_then(Value::as_str) {
        if !STANDARD_CALENDARS.contains(&calendar.to_ascii_lowercase().as_str()) {
            return None;
        }
    }

    let (unit, origin) = units.split_once(" since ")?;
    let seconds = unit_seconds(unit.trim().to_ascii_lowercase().as_str())?;
    let origin = origin.trim().trim_end_matches("UTC").trim_end_matches("+00:00");
    let origin = Label::parse_time(origin)?;

    values
        .iter()
        .map(|&value| {
            let millis = (value * seconds * 1000.0).round();
            if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
                return None;
            }
            origin.checked_add_signed(Duration::try_milliseconds(millis as i64)?)
        })
        .collect()
}
