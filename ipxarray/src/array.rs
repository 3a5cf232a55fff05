use std::{collections::BTreeMap, fmt, ops::Range, sync::Arc};

use async_trait::async_trait;
use ndarray::{ArrayD, Axis, Slice};

use crate::{
    coordinate::Coordinate,
    errors::{Error, Result},
    metadata::{Attributes, DataType},
    selection::{DimSelection, IndexSelection, ResolvedSelection, Selection},
    stream::{SelectionStream, StreamOptions},
};

/// Something that can produce the values of an array, one window at a time.
///
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Materialize exactly the values inside `window`, one range per dimension.
    ///
    /// Callers make sure the window is inside the array.
    ///
    async fn fetch(&self, window: &[Range<usize>]) -> Result<ArrayD<f64>>;
}

/// Where an array's values come from
///
#[derive(Clone)]
pub enum Source {
    /// Values held in memory
    Eager(Arc<ArrayD<f64>>),

    /// Values fetched on demand
    Lazy(Arc<dyn Fetch>),
}

impl Source {
    pub async fn resolve(&self, window: &[Range<usize>]) -> Result<ArrayD<f64>> {
        match self {
            Source::Eager(data) => Ok(data
                .slice_each_axis(|axis| Slice::from(window[axis.axis.index()].clone()))
                .to_owned()),
            Source::Lazy(fetch) => fetch.fetch(window).await,
        }
    }
}

/// A labeled N-dimensional array, with its values in memory or behind a store.
///
/// Selecting from an array never modifies it. The result of a selection is always a new array
/// holding its values in memory.
///
#[derive(Clone)]
pub struct DataArray {
    name: Option<String>,
    dims: Vec<String>,
    shape: Vec<usize>,
    dtype: DataType,
    coords: BTreeMap<String, Coordinate>,
    attrs: Attributes,
    source: Source,
}

impl DataArray {
    /// An array over values in memory, with `dims` naming each axis of `data`.
    ///
    pub fn from_array<S: AsRef<str>>(dims: &[S], data: ArrayD<f64>) -> Result<Self> {
        if dims.len() != data.ndim() {
            return Err(Error::ShapeMismatch(format!(
                "{} dimension names for {} dimensional data",
                dims.len(),
                data.ndim()
            )));
        }

        let dims: Vec<String> = dims.iter().map(|dim| dim.as_ref().to_string()).collect();
        check_repeated_dims(&dims, data.shape())?;

        Ok(Self {
            name: None,
            dims,
            shape: data.shape().to_vec(),
            dtype: DataType::Float64,
            coords: BTreeMap::new(),
            attrs: Attributes::new(),
            source: Source::Eager(Arc::new(data)),
        })
    }

    /// An array whose values are fetched on demand.
    ///
    pub fn lazy<S: AsRef<str>>(
        dims: &[S],
        shape: Vec<usize>,
        dtype: DataType,
        fetch: Arc<dyn Fetch>,
    ) -> Result<Self> {
        if dims.len() != shape.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} dimension names for shape {shape:?}",
                dims.len()
            )));
        }

        let dims: Vec<String> = dims.iter().map(|dim| dim.as_ref().to_string()).collect();
        check_repeated_dims(&dims, &shape)?;

        Ok(Self {
            name: None,
            dims,
            shape,
            dtype,
            coords: BTreeMap::new(),
            attrs: Attributes::new(),
            source: Source::Lazy(fetch),
        })
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn with_optional_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    /// Attach a coordinate to the dimension of the same name.
    ///
    pub fn with_coord(mut self, coord: Coordinate) -> Result<Self> {
        let size = self
            .size_of(coord.name())
            .ok_or_else(|| Error::DimensionNotFound(coord.name().to_string()))?;
        if coord.len() != size {
            return Err(Error::CoordinateMismatch(format!(
                "{} has {} labels for a dimension of size {size}",
                coord.name(),
                coord.len()
            )));
        }
        self.coords.insert(coord.name().to_string(), coord);

        Ok(self)
    }

    pub(crate) fn with_coords(mut self, coords: BTreeMap<String, Coordinate>) -> Self {
        self.coords = coords;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn coords(&self) -> &BTreeMap<String, Coordinate> {
        &self.coords
    }

    pub fn coord(&self, dim: &str) -> Option<&Coordinate> {
        self.coords.get(dim)
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.source, Source::Lazy(_))
    }

    /// Size of dimension `dim`, if this array has it
    ///
    pub fn size_of(&self, dim: &str) -> Option<usize> {
        self.axis_of(dim).map(|axis| self.shape[axis])
    }

    pub(crate) fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub(crate) fn sizes(&self) -> BTreeMap<String, usize> {
        self.dims.iter().cloned().zip(self.shape.iter().copied()).collect()
    }

    /// Values inside `window`, one range per dimension.
    ///
    pub async fn resolve(&self, window: &[Range<usize>]) -> Result<ArrayD<f64>> {
        if window.len() != self.ndim() {
            return Err(Error::ShapeMismatch(format!(
                "window of rank {} for an array of rank {}",
                window.len(),
                self.ndim()
            )));
        }
        for ((range, &size), dim) in window.iter().zip(&self.shape).zip(&self.dims) {
            if range.start > range.end || range.end > size {
                return Err(Error::IndexOutOfRange {
                    dim: dim.clone(),
                    index: range.end,
                    size,
                });
            }
        }

        self.source.resolve(window).await
    }

    /// Every value of this array
    ///
    pub async fn values(&self) -> Result<ArrayD<f64>> {
        let window: Vec<Range<usize>> = self.shape.iter().map(|&size| 0..size).collect();

        self.resolve(&window).await
    }

    /// A copy of this array with all of its values in memory
    ///
    pub async fn load(&self) -> Result<DataArray> {
        match self.source {
            Source::Eager(_) => Ok(self.clone()),
            Source::Lazy(_) => {
                let data = self.values().await?;

                Ok(Self {
                    source: Source::Eager(Arc::new(data)),
                    ..self.clone()
                })
            }
        }
    }

    /// Select by coordinate label
    ///
    pub async fn sel(&self, selection: &Selection) -> Result<DataArray> {
        let resolved = selection.resolve(&self.sizes(), &self.coords)?;

        self.materialize(&resolved).await
    }

    /// Select by position
    ///
    pub async fn isel(&self, selection: &IndexSelection) -> Result<DataArray> {
        let resolved = selection.resolve(&self.sizes())?;

        self.materialize(&resolved).await
    }

    /// Select by coordinate label, delivering the result in pieces of about
    /// `options.chunk_bytes` each.
    ///
    pub fn sel_stream(
        &self,
        selection: &Selection,
        options: StreamOptions,
    ) -> Result<SelectionStream<DataArray>> {
        let resolved = selection.resolve(&self.sizes(), &self.coords)?;

        SelectionStream::new(self.clone(), resolved, options)
    }

    /// Bytes the selection would take in memory, from the declared data type. No I/O.
    ///
    pub fn size_estimation(&self, selection: Option<&Selection>) -> Result<u64> {
        let resolved = match selection {
            Some(selection) => selection.resolve(&self.sizes(), &self.coords)?,
            None => ResolvedSelection::new(),
        };

        Ok(self.estimate(&resolved))
    }

    pub(crate) fn estimate(&self, resolved: &ResolvedSelection) -> u64 {
        resolved.estimate(&self.dims, &self.shape, self.dtype)
    }

    /// Fetch the selected region and shape it into a new array.
    ///
    /// Dimensions of `resolved` this array doesn't have are ignored.
    ///
    pub(crate) async fn materialize(&self, resolved: &ResolvedSelection) -> Result<DataArray> {
        let selections = resolved.for_array(&self.dims, &self.shape);
        let window: Vec<Range<usize>> = selections.iter().map(DimSelection::window).collect();
        let mut data = self.resolve(&window).await?;

        for (axis, selection) in selections.iter().enumerate() {
            match selection {
                DimSelection::Range { step, .. } if *step > 1 => {
                    data = data
                        .slice_axis(Axis(axis), Slice::new(0, None, *step as isize))
                        .to_owned();
                }
                DimSelection::Indices(indices) => {
                    let base = window[axis].start;
                    let local: Vec<usize> = indices.iter().map(|index| index - base).collect();
                    data = data.select(Axis(axis), &local);
                }
                _ => {}
            }
        }

        for (axis, selection) in selections.iter().enumerate().rev() {
            if selection.is_scalar() {
                data = data.index_axis_move(Axis(axis), 0);
            }
        }

        let mut dims = vec![];
        let mut shape = vec![];
        let mut coords = BTreeMap::new();
        for (dim, selection) in self.dims.iter().zip(&selections) {
            if selection.is_scalar() {
                continue;
            }
            dims.push(dim.clone());
            shape.push(selection.extent());
            if let Some(coord) = self.coords.get(dim).and_then(|coord| coord.select(selection)) {
                coords.insert(dim.clone(), coord);
            }
        }

        Ok(Self {
            name: self.name.clone(),
            dims,
            shape,
            dtype: self.dtype,
            coords,
            attrs: self.attrs.clone(),
            source: Source::Eager(Arc::new(data)),
        })
    }
}

impl fmt::Debug for DataArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataArray")
            .field("name", &self.name)
            .field("dims", &self.dims)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("lazy", &self.is_lazy())
            .finish()
    }
}

/// A dimension named more than once must have the same size each time
///
pub(crate) fn check_repeated_dims(dims: &[String], shape: &[usize]) -> Result<()> {
    for (axis, dim) in dims.iter().enumerate() {
        let Some(first) = dims[..axis].iter().position(|other| other == dim) else {
            continue;
        };
        if shape[first] != shape[axis] {
            return Err(Error::ShapeMismatch(format!(
                "dimension {dim} has size {} on axis {first} and {} on axis {axis}",
                shape[first], shape[axis]
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use ndarray::{array, IxDyn};

    use crate::selection::MatchPolicy;

    /// Lazy values computed from their index, counting fetches
    pub(crate) struct Computed {
        pub fetches: AtomicUsize,
    }

    #[async_trait]
    impl Fetch for Computed {
        async fn fetch(&self, window: &[Range<usize>]) -> Result<ArrayD<f64>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let shape: Vec<usize> = window.iter().map(|range| range.len()).collect();

            Ok(ArrayD::from_shape_fn(IxDyn(&shape), |index| {
                let row = index[0] + window[0].start;
                let col = index[1] + window[1].start;
                (row * 100 + col) as f64
            }))
        }
    }

    fn grid() -> Result<DataArray> {
        let data = ArrayD::from_shape_fn(IxDyn(&[4, 5]), |index| (index[0] * 100 + index[1]) as f64);
        let days: Vec<NaiveDate> = (1..=4)
            .map(|day| NaiveDate::from_ymd_opt(2022, 6, day).expect("valid date"))
            .collect();

        DataArray::from_array(&["time", "x"], data)?
            .with_name("grid")
            .with_coord(Coordinate::new("time", days))?
            .with_coord(Coordinate::new("x", vec![0.0, 0.5, 1.0, 1.5, 2.0]))
    }

    #[tokio::test]
    async fn test_sel() -> Result<()> {
        let grid = grid()?;
        let selection = Selection::new()
            .range("time", "2022-06-02", "2022-06-03")
            .label("x", 1.0);
        let result = grid.sel(&selection).await?;

        assert_eq!(result.dims(), &["time"]);
        assert_eq!(result.shape(), &[2]);
        assert_eq!(result.name(), Some("grid"));
        assert_eq!(result.values().await?, array![102.0, 202.0].into_dyn());
        assert_eq!(result.coord("time").map(Coordinate::len), Some(2));
        assert!(result.coord("x").is_none());
        assert!(!result.is_lazy());

        Ok(())
    }

    #[tokio::test]
    async fn test_sel_nearest_and_lists() -> Result<()> {
        let grid = grid()?;
        let selection = Selection::new()
            .labels("x", vec![1.9, 0.1])
            .method(MatchPolicy::Nearest);
        let result = grid.sel(&selection).await?;

        assert_eq!(result.shape(), &[4, 2]);
        assert_eq!(
            result.values().await?,
            array![[4.0, 0.0], [104.0, 100.0], [204.0, 200.0], [304.0, 300.0]].into_dyn()
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_isel_steps() -> Result<()> {
        let grid = grid()?;
        let result = grid
            .isel(&IndexSelection::new().range_step("x", 0, 5, 2).index("time", 3))
            .await?;

        assert_eq!(result.dims(), &["x"]);
        assert_eq!(result.values().await?, array![300.0, 302.0, 304.0].into_dyn());
        let x = result.coord("x").expect("x coordinate");
        assert_eq!(x.labels().len(), 3);

        assert!(matches!(
            grid.isel(&IndexSelection::new().index("time", 4)).await,
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            grid.isel(&IndexSelection::new().index("depth", 0)).await,
            Err(Error::DimensionNotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_lazy_fetches_only_the_window() -> Result<()> {
        let fetch = Arc::new(Computed {
            fetches: AtomicUsize::new(0),
        });
        let lazy = DataArray::lazy(&["row", "col"], vec![1000, 1000], DataType::Int32, fetch.clone())?;
        assert!(lazy.is_lazy());
        assert_eq!(fetch.fetches.load(Ordering::SeqCst), 0);

        let result = lazy
            .isel(&IndexSelection::new().indices("row", vec![7, 5]).range("col", 10, 12))
            .await?;
        assert_eq!(fetch.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.values().await?,
            array![[710.0, 711.0], [510.0, 511.0]].into_dyn()
        );
        assert_eq!(result.dtype(), DataType::Int32);

        Ok(())
    }

    #[tokio::test]
    async fn test_size_estimation() -> Result<()> {
        let fetch = Arc::new(Computed {
            fetches: AtomicUsize::new(0),
        });
        let lazy = DataArray::lazy(&["row", "col"], vec![1000, 10], DataType::Float32, fetch.clone())?;

        assert_eq!(lazy.size_estimation(None)?, 40_000);
        assert_eq!(
            lazy.size_estimation(Some(&Selection::new().range("row", 0, 99)))?,
            4_000
        );
        assert_eq!(lazy.size_estimation(Some(&Selection::new().label("row", 3)))?, 40);
        assert_eq!(fetch.fetches.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_load() -> Result<()> {
        let fetch = Arc::new(Computed {
            fetches: AtomicUsize::new(0),
        });
        let lazy = DataArray::lazy(&["row", "col"], vec![2, 2], DataType::Float64, fetch)?;
        let eager = lazy.load().await?;

        assert!(!eager.is_lazy());
        assert_eq!(eager.values().await?, array![[0.0, 1.0], [100.0, 101.0]].into_dyn());

        Ok(())
    }

    #[test]
    fn test_construction_errors() -> Result<()> {
        assert!(matches!(
            DataArray::from_array(&["x"], ArrayD::zeros(IxDyn(&[2, 2]))),
            Err(Error::ShapeMismatch(_))
        ));

        let array = DataArray::from_array(&["x"], ArrayD::zeros(IxDyn(&[3])))?;
        assert!(matches!(
            array.clone().with_coord(Coordinate::new("x", vec![1, 2])),
            Err(Error::CoordinateMismatch(_))
        ));
        assert!(matches!(
            array.with_coord(Coordinate::new("y", vec![1, 2, 3])),
            Err(Error::DimensionNotFound(_))
        ));

        // A repeated dimension name has to mean the same size both times
        assert!(matches!(
            DataArray::from_array(&["x", "x"], ArrayD::zeros(IxDyn(&[2, 3]))),
            Err(Error::ShapeMismatch(_))
        ));
        let fetch = Arc::new(Computed {
            fetches: AtomicUsize::new(0),
        });
        assert!(matches!(
            DataArray::lazy(&["x", "x"], vec![3, 2], DataType::Float64, fetch),
            Err(Error::ShapeMismatch(_))
        ));
        let square = DataArray::from_array(&["x", "x"], ArrayD::zeros(IxDyn(&[2, 2])))?;
        assert_eq!(square.shape(), &[2, 2]);

        Ok(())
    }
}
