use std::{ops::Range, sync::Arc};

use async_trait::async_trait;
use futures::future::try_join;
use ndarray::{concatenate, ArrayD, Axis};
use tracing::trace;

use crate::{
    array::{DataArray, Fetch},
    errors::{Error, Result},
    metadata::DataType,
};

impl DataArray {
    /// Join `other` onto the end of this array along `dim`.
    ///
    /// Both arrays must have the same dimensions in the same order, with equal extents everywhere
    /// but along `dim`. The result is lazy and reads from whichever of the two arrays a window
    /// falls in. Name, attributes and the coordinates of the other dimensions are this array's.
    ///
    pub fn concat(&self, other: &DataArray, dim: &str) -> Result<DataArray> {
        let axis = self
            .axis_of(dim)
            .ok_or_else(|| Error::DimensionNotFound(dim.to_string()))?;
        if self.dims() != other.dims() {
            return Err(Error::ShapeMismatch(format!(
                "can't concatenate dimensions {:?} with {:?}",
                self.dims(),
                other.dims()
            )));
        }
        for (i, (&a, &b)) in self.shape().iter().zip(other.shape()).enumerate() {
            if i != axis && a != b {
                return Err(Error::ShapeMismatch(format!(
                    "dimension {} has size {a} in one array and {b} in the other",
                    self.dims()[i]
                )));
            }
        }

        let split = self.shape()[axis];
        let mut shape = self.shape().to_vec();
        shape[axis] += other.shape()[axis];

        let mut coords = self.coords().clone();
        match (self.coord(dim), other.coord(dim)) {
            (Some(first), Some(second)) => {
                coords.insert(dim.to_string(), first.append(second));
            }
            _ => {
                coords.remove(dim);
            }
        }

        let dtype = if self.dtype() == other.dtype() {
            self.dtype()
        } else {
            DataType::Float64
        };
        let fetch = Arc::new(ConcatFetch {
            first: self.clone(),
            second: other.clone(),
            axis,
            split,
        });

        Ok(DataArray::lazy(self.dims(), shape, dtype, fetch)?
            .with_optional_name(self.name().map(str::to_string))
            .with_attrs(self.attrs().clone())
            .with_coords(coords))
    }
}

/// Routes windows of a concatenation to its two halves
///
struct ConcatFetch {
    first: DataArray,
    second: DataArray,
    axis: usize,

    /// Extent of `first` along `axis`
    split: usize,
}

impl ConcatFetch {
    /// `window` moved into the second array's index space, starting no lower than `split`
    fn shifted(&self, window: &[Range<usize>]) -> Vec<Range<usize>> {
        let mut window = window.to_vec();
        let range = &mut window[self.axis];
        *range = range.start.max(self.split) - self.split..range.end - self.split;

        window
    }

    /// `window` cut off at `split`
    fn clipped(&self, window: &[Range<usize>]) -> Vec<Range<usize>> {
        let mut window = window.to_vec();
        window[self.axis].end = self.split;

        window
    }
}

#[async_trait]
impl Fetch for ConcatFetch {
    async fn fetch(&self, window: &[Range<usize>]) -> Result<ArrayD<f64>> {
        let range = &window[self.axis];
        if range.end <= self.split {
            return self.first.resolve(window).await;
        }
        if range.start >= self.split {
            return self.second.resolve(&self.shifted(window)).await;
        }

        trace!(axis = self.axis, start = range.start, end = range.end, "window spans both arrays");
        let clipped = self.clipped(window);
        let shifted = self.shifted(window);
        let (head, tail) =
            try_join(self.first.resolve(&clipped), self.second.resolve(&shifted)).await?;

        concatenate(Axis(self.axis), &[head.view(), tail.view()])
            .map_err(|err| Error::ShapeMismatch(err.to_string()))
    }
}
