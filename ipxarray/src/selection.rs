//! Turning label and position based selections into index selections.
//!
use std::{cmp::Ordering, collections::BTreeMap, ops::Range};

use crate::{
    coordinate::Coordinate,
    errors::{Error, Result},
    label::Label,
    metadata::DataType,
};

/// How a requested label is matched against a coordinate
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// The label must be present
    #[default]
    Exact,

    /// Closest label, ties going to the lower index
    Nearest,

    /// Greatest label less than or equal to the requested label
    ForwardFill,

    /// Least label greater than or equal to the requested label
    BackwardFill,
}

/// What is selected along one dimension, by label
///
#[derive(Clone, Debug)]
pub enum LabelIndexer {
    Label(Label),

    /// Labels from `start` through `stop`, both inclusive, taking every `step`th. An open end
    /// extends to that end of the coordinate.
    Range {
        start: Option<Label>,
        stop: Option<Label>,
        step: usize,
    },

    Labels(Vec<Label>),
}

/// A label based selection over any number of dimensions
///
/// ```ignore
/// let selection = Selection::new()
///     .range("time", "2020-01-01", "2020-01-31")
///     .label("lat", 40.5)
///     .method(MatchPolicy::Nearest)
///     .tolerance(0.25);
/// ```
///
#[derive(Clone, Debug, Default)]
pub struct Selection {
    indexers: BTreeMap<String, LabelIndexer>,
    method: MatchPolicy,
    tolerance: Option<f64>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label<S, L>(mut self, dim: S, label: L) -> Self
    where
        S: Into<String>,
        L: Into<Label>,
    {
        self.indexers
            .insert(dim.into(), LabelIndexer::Label(label.into()));
        self
    }

    pub fn labels<S, L>(mut self, dim: S, labels: Vec<L>) -> Self
    where
        S: Into<String>,
        L: Into<Label>,
    {
        self.indexers.insert(
            dim.into(),
            LabelIndexer::Labels(labels.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Select labels from `start` through `stop`, inclusive
    ///
    pub fn range<S, L>(self, dim: S, start: L, stop: L) -> Self
    where
        S: Into<String>,
        L: Into<Label>,
    {
        self.range_step(dim, Some(start.into()), Some(stop.into()), 1)
    }

    pub fn range_step<S: Into<String>>(
        mut self,
        dim: S,
        start: Option<Label>,
        stop: Option<Label>,
        step: usize,
    ) -> Self {
        self.indexers
            .insert(dim.into(), LabelIndexer::Range { start, stop, step });
        self
    }

    pub fn method(mut self, method: MatchPolicy) -> Self {
        self.method = method;
        self
    }

    /// Largest distance accepted by inexact matching. Seconds, for time coordinates.
    ///
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.indexers.is_empty()
    }

    /// Resolve to index positions.
    ///
    /// `sizes` gives the size of every dimension that may be selected on. A dimension without
    /// a coordinate has its positions for labels.
    ///
    pub(crate) fn resolve(
        &self,
        sizes: &BTreeMap<String, usize>,
        coords: &BTreeMap<String, Coordinate>,
    ) -> Result<ResolvedSelection> {
        let mut resolved = ResolvedSelection::default();
        for (dim, indexer) in &self.indexers {
            let size = *sizes
                .get(dim)
                .ok_or_else(|| Error::DimensionNotFound(dim.clone()))?;
            let positional;
            let coord = match coords.get(dim) {
                Some(coord) => coord,
                None => {
                    positional = Coordinate::new(dim.as_str(), (0..size as i64).collect::<Vec<_>>());
                    &positional
                }
            };

            let selection = match indexer {
                LabelIndexer::Label(label) => DimSelection::Index(self.match_label(coord, label)?),
                LabelIndexer::Labels(labels) => DimSelection::Indices(
                    labels
                        .iter()
                        .map(|label| self.match_label(coord, label))
                        .collect::<Result<_>>()?,
                ),
                LabelIndexer::Range { start, stop, step } => {
                    label_range(coord, start.as_ref(), stop.as_ref(), *step)?
                }
            };
            resolved.insert(dim.clone(), selection);
        }

        Ok(resolved)
    }

    fn match_label(&self, coord: &Coordinate, label: &Label) -> Result<usize> {
        let labels = coord.labels();
        let label = match labels.first() {
            Some(first) => label.coerce_like(first),
            None => label.clone(),
        };
        let not_found = || Error::LabelNotFound {
            dim: coord.name().to_string(),
            label: label.to_string(),
        };
        let comparable = labels
            .first()
            .map(|first| first.compare(&label).is_some())
            .unwrap_or(false);
        if !comparable {
            return Err(not_found());
        }

        if self.method != MatchPolicy::Exact && !coord.is_ascending() {
            return Err(Error::NonMonotonicCoordinate(coord.name().to_string()));
        }

        let below = labels.partition_point(|x| x.compare(&label) == Some(Ordering::Less));
        let index = match self.method {
            MatchPolicy::Exact => return find_exact(coord, &label).ok_or_else(not_found),
            MatchPolicy::Nearest => {
                let distance = |i: usize| labels[i].distance(&label).unwrap_or(f64::INFINITY);
                if below == labels.len() {
                    below - 1
                } else if below > 0 && distance(below - 1) <= distance(below) {
                    below - 1
                } else {
                    below
                }
            }
            MatchPolicy::ForwardFill => {
                let through = labels.partition_point(|x| {
                    matches!(x.compare(&label), Some(Ordering::Less | Ordering::Equal))
                });
                if through == 0 {
                    return Err(not_found());
                }
                through - 1
            }
            MatchPolicy::BackwardFill => {
                if below == labels.len() {
                    return Err(not_found());
                }
                below
            }
        };

        if let Some(tolerance) = self.tolerance {
            let distance = labels[index].distance(&label).unwrap_or(f64::INFINITY);
            if distance > tolerance {
                return Err(Error::ToleranceExceeded {
                    dim: coord.name().to_string(),
                    label: label.to_string(),
                    distance,
                    tolerance,
                });
            }
        }

        Ok(index)
    }
}

fn find_exact(coord: &Coordinate, label: &Label) -> Option<usize> {
    let labels = coord.labels();
    if coord.is_ascending() {
        let at = labels.partition_point(|x| x.compare(label) == Some(Ordering::Less));
        (at < labels.len() && labels[at] == *label).then_some(at)
    } else {
        labels.iter().position(|x| x == label)
    }
}

fn label_range(
    coord: &Coordinate,
    start: Option<&Label>,
    stop: Option<&Label>,
    step: usize,
) -> Result<DimSelection> {
    if step == 0 {
        return Err(Error::InvalidSelection(format!(
            "step of zero for {}",
            coord.name()
        )));
    }
    if !coord.is_ascending() {
        return Err(Error::NonMonotonicCoordinate(coord.name().to_string()));
    }

    let labels = coord.labels();
    let bound = |label: &Label| {
        let label = match labels.first() {
            Some(first) => label.coerce_like(first),
            None => label.clone(),
        };
        match labels.first() {
            Some(first) if first.compare(&label).is_none() => Err(Error::LabelNotFound {
                dim: coord.name().to_string(),
                label: label.to_string(),
            }),
            _ => Ok(label),
        }
    };

    let start = match start {
        None => 0,
        Some(label) => {
            let label = bound(label)?;
            labels.partition_point(|x| x.compare(&label) == Some(Ordering::Less))
        }
    };
    let stop = match stop {
        None => labels.len(),
        Some(label) => {
            let label = bound(label)?;
            labels.partition_point(|x| {
                matches!(x.compare(&label), Some(Ordering::Less | Ordering::Equal))
            })
        }
    };

    Ok(DimSelection::Range {
        start,
        stop: stop.max(start),
        step,
    })
}

/// What is selected along one dimension, by position
///
#[derive(Clone, Debug)]
pub enum Indexer {
    Index(usize),
    Indices(Vec<usize>),
    Range {
        start: usize,
        stop: usize,
        step: usize,
    },
}

/// A position based selection over any number of dimensions
///
#[derive(Clone, Debug, Default)]
pub struct IndexSelection {
    indexers: BTreeMap<String, Indexer>,
}

impl IndexSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index<S: Into<String>>(mut self, dim: S, index: usize) -> Self {
        self.indexers.insert(dim.into(), Indexer::Index(index));
        self
    }

    pub fn indices<S: Into<String>>(mut self, dim: S, indices: Vec<usize>) -> Self {
        self.indexers.insert(dim.into(), Indexer::Indices(indices));
        self
    }

    /// Positions `start..stop`
    ///
    pub fn range<S: Into<String>>(self, dim: S, start: usize, stop: usize) -> Self {
        self.range_step(dim, start, stop, 1)
    }

    pub fn range_step<S: Into<String>>(
        mut self,
        dim: S,
        start: usize,
        stop: usize,
        step: usize,
    ) -> Self {
        self.indexers
            .insert(dim.into(), Indexer::Range { start, stop, step });
        self
    }

    pub(crate) fn resolve(&self, sizes: &BTreeMap<String, usize>) -> Result<ResolvedSelection> {
        let mut resolved = ResolvedSelection::default();
        for (dim, indexer) in &self.indexers {
            let size = *sizes
                .get(dim)
                .ok_or_else(|| Error::DimensionNotFound(dim.clone()))?;
            let check = |index: usize| {
                if index < size {
                    Ok(index)
                } else {
                    Err(Error::IndexOutOfRange {
                        dim: dim.clone(),
                        index,
                        size,
                    })
                }
            };

            let selection = match indexer {
                Indexer::Index(index) => DimSelection::Index(check(*index)?),
                Indexer::Indices(indices) => DimSelection::Indices(
                    indices
                        .iter()
                        .map(|&index| check(index))
                        .collect::<Result<_>>()?,
                ),
                &Indexer::Range { start, stop, step } => {
                    if step == 0 {
                        return Err(Error::InvalidSelection(format!("step of zero for {dim}")));
                    }
                    if stop > size {
                        return Err(Error::IndexOutOfRange {
                            dim: dim.clone(),
                            index: stop,
                            size,
                        });
                    }
                    if start > stop {
                        return Err(Error::InvalidSelection(format!(
                            "range {start}..{stop} for {dim} is inverted"
                        )));
                    }
                    DimSelection::Range { start, stop, step }
                }
            };
            resolved.insert(dim.clone(), selection);
        }

        Ok(resolved)
    }
}

/// A selection along one dimension, resolved to positions
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DimSelection {
    /// A single position. The dimension is dropped from the result.
    Index(usize),

    Range {
        start: usize,
        stop: usize,
        step: usize,
    },

    Indices(Vec<usize>),
}

impl DimSelection {
    /// Everything along a dimension of `size`
    pub fn full(size: usize) -> Self {
        DimSelection::Range {
            start: 0,
            stop: size,
            step: 1,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, DimSelection::Index(_))
    }

    /// Number of positions selected
    ///
    pub fn extent(&self) -> usize {
        match self {
            DimSelection::Index(_) => 1,
            DimSelection::Range { start, stop, step } => {
                let step = (*step).max(1);
                (stop.saturating_sub(*start) + step - 1) / step
            }
            DimSelection::Indices(indices) => indices.len(),
        }
    }

    /// Every selected position, in result order
    ///
    pub fn positions(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            DimSelection::Index(index) => Box::new(std::iter::once(*index)),
            DimSelection::Range { start, stop, step } => {
                Box::new((*start..*stop).step_by((*step).max(1)))
            }
            DimSelection::Indices(indices) => Box::new(indices.iter().copied()),
        }
    }

    /// Smallest contiguous range of positions holding everything selected
    ///
    pub fn window(&self) -> Range<usize> {
        match self {
            DimSelection::Index(index) => *index..*index + 1,
            DimSelection::Range { start, step, .. } => match self.extent() {
                0 => *start..*start,
                extent => *start..*start + (extent - 1) * step + 1,
            },
            DimSelection::Indices(indices) => {
                match (indices.iter().min(), indices.iter().max()) {
                    (Some(&min), Some(&max)) => min..max + 1,
                    _ => 0..0,
                }
            }
        }
    }

    /// The part of this selection from result position `from` up to `to`
    ///
    pub fn narrow(&self, from: usize, to: usize) -> Self {
        match self {
            DimSelection::Index(_) => self.clone(),
            &DimSelection::Range { start, stop, step } => DimSelection::Range {
                start: (start + from * step).min(stop),
                stop: (start + to * step).min(stop),
                step,
            },
            DimSelection::Indices(indices) => {
                let to = to.min(indices.len());
                DimSelection::Indices(indices[from.min(to)..to].to_vec())
            }
        }
    }
}

/// Per dimension index selections. Dimensions not mentioned are selected in full.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedSelection {
    dims: BTreeMap<String, DimSelection>,
}

impl ResolvedSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, dim: S, selection: DimSelection) {
        self.dims.insert(dim.into(), selection);
    }

    pub fn get(&self, dim: &str) -> Option<&DimSelection> {
        self.dims.get(dim)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DimSelection)> {
        self.dims.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// One selection per dimension of an array with `dims` and `shape`
    ///
    pub(crate) fn for_array(&self, dims: &[String], shape: &[usize]) -> Vec<DimSelection> {
        dims.iter()
            .zip(shape)
            .map(|(dim, &size)| {
                self.dims
                    .get(dim)
                    .cloned()
                    .unwrap_or_else(|| DimSelection::full(size))
            })
            .collect()
    }

    /// Bytes taken by the selected part of an array, going by its declared data type
    ///
    pub(crate) fn estimate(&self, dims: &[String], shape: &[usize], data_type: DataType) -> u64 {
        self.for_array(dims, shape)
            .iter()
            .map(|selection| selection.extent() as u64)
            .product::<u64>()
            * data_type.byte_width() as u64
    }
}
