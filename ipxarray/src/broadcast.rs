//! Elementwise operations over arrays with differing dimensions.
//!
use std::{collections::BTreeMap, fmt, ops::Range, sync::Arc};

use async_trait::async_trait;
use futures::future::try_join_all;
use ndarray::{ArrayD, IxDyn};

use crate::{
    array::{DataArray, Fetch},
    coordinate::Coordinate,
    errors::{Error, Result},
    geom::window_shape,
    metadata::{Attributes, DataType},
};

/// One input of an elementwise operation
///
#[derive(Clone, Debug)]
pub enum Operand {
    Array(DataArray),

    /// The same value at every position
    Scalar(f64),
}

impl From<DataArray> for Operand {
    fn from(array: DataArray) -> Self {
        Operand::Array(array)
    }
}

impl From<&DataArray> for Operand {
    fn from(array: &DataArray) -> Self {
        Operand::Array(array.clone())
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Scalar(value)
    }
}

type CombineAttrs = dyn Fn(&[&Attributes]) -> Attributes + Send + Sync;

/// Where the attributes of a result come from
///
#[derive(Clone, Default)]
pub enum AttrPolicy {
    /// The result has no attributes
    #[default]
    Drop,

    /// The attributes of the operand at this position
    From(usize),

    /// Computed from the attributes of every operand, in order. Scalars contribute empty
    /// attributes.
    Combine(Arc<CombineAttrs>),
}

impl fmt::Debug for AttrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrPolicy::Drop => write!(f, "Drop"),
            AttrPolicy::From(index) => write!(f, "From({index})"),
            AttrPolicy::Combine(_) => write!(f, "Combine(..)"),
        }
    }
}

/// How names and attributes carry over into the result of an elementwise operation
///
#[derive(Clone, Debug, Default)]
pub struct CombineOptions {
    pub attrs: AttrPolicy,

    /// Operand positions to take the result's name from. The first named array wins.
    pub name_preference: Vec<usize>,
}

impl CombineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attrs(mut self, attrs: AttrPolicy) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn prefer_names(mut self, order: &[usize]) -> Self {
        self.name_preference = order.to_vec();
        self
    }
}

type Combinator = dyn Fn(&[f64]) -> f64 + Send + Sync;

impl DataArray {
    /// Pick from `x` where `cond` is true and from `y` elsewhere.
    ///
    /// A condition value is true when it is neither zero nor NaN. The result lies over the union
    /// of the operands' dimensions and is computed lazily.
    ///
    /// Options default to the attributes of `x` and the name of `x`, then of `y`.
    ///
    pub fn where_<C, X, Y>(cond: C, x: X, y: Y, options: Option<CombineOptions>) -> Result<Self>
    where
        C: Into<Operand>,
        X: Into<Operand>,
        Y: Into<Operand>,
    {
        let options = options.unwrap_or_else(|| {
            CombineOptions::new()
                .attrs(AttrPolicy::From(1))
                .prefer_names(&[1, 2])
        });
        let select: Arc<Combinator> = Arc::new(|values: &[f64]| {
            let cond = values[0];
            if cond != 0.0 && !cond.is_nan() {
                values[1]
            } else {
                values[2]
            }
        });

        combine(vec![cond.into(), x.into(), y.into()], select, &options)
    }

    /// Apply `f` to each pair of values of `a` and `b`, broadcast against each other.
    ///
    /// Options default to the attributes of `a` and the name of `a`, then of `b`.
    ///
    pub fn zip_with<A, B, F>(a: A, b: B, f: F, options: Option<CombineOptions>) -> Result<Self>
    where
        A: Into<Operand>,
        B: Into<Operand>,
        F: Fn(f64, f64) -> f64 + Send + Sync + 'static,
    {
        let options = options.unwrap_or_else(|| {
            CombineOptions::new()
                .attrs(AttrPolicy::From(0))
                .prefer_names(&[0, 1])
        });
        let binary: Arc<Combinator> = Arc::new(move |values: &[f64]| f(values[0], values[1]));

        combine(vec![a.into(), b.into()], binary, &options)
    }
}

/// Broadcast `operands` against each other and combine them elementwise with `f`.
///
fn combine(operands: Vec<Operand>, f: Arc<Combinator>, options: &CombineOptions) -> Result<DataArray> {
    let mut dims: Vec<String> = vec![];
    let mut shape: Vec<usize> = vec![];
    let mut coords: BTreeMap<String, Coordinate> = BTreeMap::new();

    for array in arrays(&operands) {
        for (dim, &size) in array.dims().iter().zip(array.shape()) {
            match dims.iter().position(|d| d == dim) {
                Some(axis) if shape[axis] != size => {
                    return Err(Error::CoordinateMismatch(format!(
                        "dimension {dim} has size {} in one operand and {size} in another",
                        shape[axis]
                    )));
                }
                Some(_) => {}
                None => {
                    dims.push(dim.clone());
                    shape.push(size);
                }
            }

            if let Some(coord) = array.coord(dim) {
                match coords.get(dim) {
                    Some(existing) if !existing.same_labels(coord) => {
                        return Err(Error::CoordinateMismatch(format!(
                            "operands have different labels along {dim}"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        coords.insert(dim.clone(), coord.clone());
                    }
                }
            }
        }
    }

    // For each operand, the output axis of each of its own axes
    let axes: Vec<Vec<usize>> = operands
        .iter()
        .map(|operand| match operand {
            Operand::Array(array) => array
                .dims()
                .iter()
                .filter_map(|dim| dims.iter().position(|d| d == dim))
                .collect(),
            Operand::Scalar(_) => vec![],
        })
        .collect();

    let name = options.name_preference.iter().find_map(|&index| match operands.get(index) {
        Some(Operand::Array(array)) => array.name().map(str::to_string),
        _ => None,
    });

    let empty = Attributes::new();
    let attrs = match &options.attrs {
        AttrPolicy::Drop => Attributes::new(),
        AttrPolicy::From(index) => match operands.get(*index) {
            Some(Operand::Array(array)) => array.attrs().clone(),
            _ => Attributes::new(),
        },
        AttrPolicy::Combine(merge) => {
            let all: Vec<&Attributes> = operands
                .iter()
                .map(|operand| match operand {
                    Operand::Array(array) => array.attrs(),
                    Operand::Scalar(_) => &empty,
                })
                .collect();
            merge(&all)
        }
    };

    let dtype = common_dtype(&operands);
    let fetch = Arc::new(ElementwiseFetch { operands, axes, f });

    Ok(DataArray::lazy(&dims, shape, dtype, fetch)?
        .with_optional_name(name)
        .with_attrs(attrs)
        .with_coords(coords))
}

fn arrays(operands: &[Operand]) -> impl Iterator<Item = &DataArray> {
    operands.iter().filter_map(|operand| match operand {
        Operand::Array(array) => Some(array),
        Operand::Scalar(_) => None,
    })
}

/// The data type shared by every array operand, `Float64` if they differ
///
fn common_dtype(operands: &[Operand]) -> DataType {
    let mut dtypes = arrays(operands).map(DataArray::dtype);
    match dtypes.next() {
        Some(first) if dtypes.all(|dtype| dtype == first) => first,
        _ => DataType::Float64,
    }
}

/// Lazily combines windows of several operands
///
struct ElementwiseFetch {
    operands: Vec<Operand>,
    axes: Vec<Vec<usize>>,
    f: Arc<Combinator>,
}

#[async_trait]
impl Fetch for ElementwiseFetch {
    async fn fetch(&self, window: &[Range<usize>]) -> Result<ArrayD<f64>> {
        let inputs = try_join_all(self.operands.iter().zip(&self.axes).map(
            |(operand, axes)| async move {
                match operand {
                    Operand::Array(array) => {
                        let local: Vec<Range<usize>> =
                            axes.iter().map(|&axis| window[axis].clone()).collect();
                        Ok::<_, Error>(Some(array.resolve(&local).await?))
                    }
                    Operand::Scalar(_) => Ok(None),
                }
            },
        ))
        .await?;

        let mut values = vec![0.0; self.operands.len()];
        let mut index = vec![];
        Ok(ArrayD::from_shape_fn(IxDyn(&window_shape(window)), |cell| {
            for (i, (operand, input)) in self.operands.iter().zip(&inputs).enumerate() {
                values[i] = match (operand, input) {
                    (_, Some(input)) => {
                        index.clear();
                        index.extend(self.axes[i].iter().map(|&axis| cell[axis]));
                        input[index.as_slice()]
                    }
                    (Operand::Scalar(value), None) => *value,
                    (Operand::Array(_), None) => f64::NAN,
                };
            }
            (self.f)(&values[..])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;
    use ndarray::array;
    use serde_json::json;

    fn days(n: u32) -> Coordinate {
        let days: Vec<NaiveDate> = (1..=n)
            .map(|day| NaiveDate::from_ymd_opt(2023, 3, day).expect("valid date"))
            .collect();

        Coordinate::new("time", days)
    }

    fn attrs(value: serde_json::Value) -> Attributes {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Attributes::new(),
        }
    }

    #[tokio::test]
    async fn test_where() -> Result<()> {
        let cond = DataArray::from_array(&["time"], array![1.0, 0.0, f64::NAN, -2.0].into_dyn())?
            .with_coord(days(4))?;
        let x = DataArray::from_array(
            &["time", "lat"],
            ArrayD::from_shape_fn(IxDyn(&[4, 3]), |i| (i[0] * 10 + i[1]) as f64),
        )?
        .with_name("x")
        .with_attrs(attrs(json!({"units": "mm"})))
        .with_coord(days(4))?
        .with_coord(Coordinate::new("lat", vec![10.0, 20.0, 30.0]))?;

        let result = DataArray::where_(&cond, &x, -1.0, None)?;
        assert!(result.is_lazy());
        assert_eq!(result.dims(), &["time", "lat"]);
        assert_eq!(result.shape(), &[4, 3]);
        assert_eq!(result.name(), Some("x"));
        assert_eq!(result.attrs()["units"], "mm");
        assert_eq!(result.coord("lat").map(Coordinate::len), Some(3));

        let values = result.values().await?;
        for time in 0..4 {
            for lat in 0..3 {
                let expected = if time == 0 || time == 3 {
                    (time * 10 + lat) as f64
                } else {
                    -1.0
                };
                assert_eq!(values[[time, lat]], expected);
            }
        }

        let window = result.resolve(&[1..3, 2..3]).await?;
        assert_eq!(window, array![[-1.0], [-1.0]].into_dyn());

        Ok(())
    }

    #[tokio::test]
    async fn test_zip_with_transposed() -> Result<()> {
        let a = DataArray::from_array(
            &["lat", "time"],
            ArrayD::from_shape_fn(IxDyn(&[2, 3]), |i| (i[0] * 3 + i[1]) as f64),
        )?;
        let b = DataArray::from_array(
            &["time", "lat"],
            ArrayD::from_shape_fn(IxDyn(&[3, 2]), |i| (i[0] * 100 + i[1] * 1000) as f64),
        )?
        .with_name("b");

        let sum = DataArray::zip_with(&a, &b, |a, b| a + b, None)?;
        assert_eq!(sum.dims(), &["lat", "time"]);
        assert_eq!(sum.name(), Some("b"));
        assert_eq!(
            sum.values().await?,
            array![[0.0, 101.0, 202.0], [1003.0, 1104.0, 1205.0]].into_dyn()
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_adds_dimensions() -> Result<()> {
        let row = DataArray::from_array(&["x"], array![1.0, 2.0].into_dyn())?;
        let col = DataArray::from_array(&["y"], array![10.0, 20.0, 30.0].into_dyn())?;

        let product = DataArray::zip_with(&row, &col, |a, b| a * b, None)?;
        assert_eq!(product.dims(), &["x", "y"]);
        assert_eq!(
            product.values().await?,
            array![[10.0, 20.0, 30.0], [20.0, 40.0, 60.0]].into_dyn()
        );

        let scalars = DataArray::zip_with(2.0, 3.0, |a, b| a * b, None)?;
        assert_eq!(scalars.ndim(), 0);
        assert_eq!(scalars.values().await?.into_raw_vec(), vec![6.0]);

        Ok(())
    }

    #[test]
    fn test_mismatched_operands() -> Result<()> {
        let three = DataArray::from_array(&["time"], array![1.0, 2.0, 3.0].into_dyn())?
            .with_coord(days(3))?;
        let shifted = DataArray::from_array(&["time"], array![1.0, 2.0, 3.0].into_dyn())?
            .with_coord(Coordinate::new("time", vec![
                NaiveDate::from_ymd_opt(2023, 3, 2).expect("valid date"),
                NaiveDate::from_ymd_opt(2023, 3, 3).expect("valid date"),
                NaiveDate::from_ymd_opt(2023, 3, 4).expect("valid date"),
            ]))?;
        let two = DataArray::from_array(&["time"], array![1.0, 2.0].into_dyn())?;

        assert!(matches!(
            DataArray::zip_with(&three, &shifted, |a, b| a + b, None),
            Err(Error::CoordinateMismatch(_))
        ));
        assert!(matches!(
            DataArray::where_(&two, &three, 0.0, None),
            Err(Error::CoordinateMismatch(_))
        ));

        // Same dates from a differently typed source still line up
        let same = DataArray::from_array(&["time"], array![0.0, 0.0, 0.0].into_dyn())?
            .with_coord(days(3))?;
        assert!(DataArray::zip_with(&three, &same, |a, b| a + b, None).is_ok());

        Ok(())
    }

    #[test]
    fn test_attribute_policies() -> Result<()> {
        let a = DataArray::from_array(&["x"], array![1.0].into_dyn())?
            .with_name("a")
            .with_attrs(attrs(json!({"source": "a", "units": "m"})));
        let b = DataArray::from_array(&["x"], array![2.0].into_dyn())?
            .with_attrs(attrs(json!({"source": "b"})));

        let dropped = DataArray::zip_with(
            &a,
            &b,
            |a, b| a - b,
            Some(CombineOptions::new().prefer_names(&[1])),
        )?;
        assert!(dropped.attrs().is_empty());
        assert_eq!(dropped.name(), None);

        let combined = DataArray::zip_with(
            &a,
            &b,
            |a, b| a - b,
            Some(
                CombineOptions::new()
                    .attrs(AttrPolicy::Combine(Arc::new(|all: &[&Attributes]| {
                        let mut merged = Attributes::new();
                        for attrs in all {
                            for (key, value) in attrs.iter() {
                                merged.entry(key.clone()).or_insert_with(|| value.clone());
                            }
                        }
                        merged
                    })))
                    .prefer_names(&[1, 0]),
            ),
        )?;
        assert_eq!(combined.attrs()["source"], "a");
        assert_eq!(combined.attrs()["units"], "m");
        assert_eq!(combined.name(), Some("a"));

        let from_b = DataArray::where_(
            1.0,
            &a,
            &b,
            Some(CombineOptions::new().attrs(AttrPolicy::From(2))),
        )?;
        assert_eq!(from_b.attrs()["source"], "b");

        Ok(())
    }
}
