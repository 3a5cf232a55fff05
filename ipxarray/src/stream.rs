//! Delivering a large selection in byte-budgeted pieces.
//!
use async_trait::async_trait;
use futures::{stream, Stream};
use tracing::{debug, trace};

use crate::{
    array::DataArray,
    errors::{Error, Result},
    metadata::DataType,
    selection::{DimSelection, ResolvedSelection},
};

/// How a selection stream cuts up its selection
///
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Approximate size of each piece, in bytes of the declared data type
    pub chunk_bytes: u64,

    /// Dimension to cut along. Defaults to the one with the most selected positions.
    pub dimension: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_bytes: 64 << 20,
            dimension: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Estimated bytes delivered so far, this piece included
    pub bytes_processed: u64,
    pub total_bytes: u64,

    /// Which piece this is, counting from 1
    pub chunk: usize,
    pub chunks: usize,
}

/// One piece of a streamed selection
///
#[derive(Debug)]
pub struct StreamChunk<T> {
    pub data: T,
    pub progress: Progress,
}

/// Anything a resolved selection can be materialized from
///
#[async_trait]
pub trait Materialize: Clone + Send + Sync + 'static {
    type Output: Send;

    async fn materialize_selection(&self, resolved: &ResolvedSelection) -> Result<Self::Output>;

    /// Estimated bytes the selection takes in memory
    fn estimate_selection(&self, resolved: &ResolvedSelection) -> u64;

    /// Dimensions, shape and data type used to plan how the selection is cut up. When a
    /// dimension to cut along is given, the reference must have it.
    fn reference(
        &self,
        resolved: &ResolvedSelection,
        along: Option<&str>,
    ) -> Option<(Vec<String>, Vec<usize>, DataType)>;
}

#[async_trait]
impl Materialize for DataArray {
    type Output = DataArray;

    async fn materialize_selection(&self, resolved: &ResolvedSelection) -> Result<DataArray> {
        self.materialize(resolved).await
    }

    fn estimate_selection(&self, resolved: &ResolvedSelection) -> u64 {
        self.estimate(resolved)
    }

    fn reference(
        &self,
        _resolved: &ResolvedSelection,
        _along: Option<&str>,
    ) -> Option<(Vec<String>, Vec<usize>, DataType)> {
        Some((self.dims().to_vec(), self.shape().to_vec(), self.dtype()))
    }
}

/// A pull based sequence of pieces of one selection.
///
/// Nothing is fetched until `next` is called, and each call fetches one piece. Dropping the
/// stream is all it takes to stop early. The first failure ends the sequence.
///
pub struct SelectionStream<T: Materialize> {
    target: T,
    resolved: ResolvedSelection,

    /// Dimension being cut along and its full selection, if there is one to cut
    along: Option<(String, DimSelection)>,

    /// Positions of `along` in each piece
    step: usize,
    chunks: usize,
    next_chunk: usize,
    bytes_processed: u64,
    total_bytes: u64,
    finished: bool,
}

impl<T: Materialize> SelectionStream<T> {
    pub(crate) fn new(target: T, resolved: ResolvedSelection, options: StreamOptions) -> Result<Self> {
        let total_bytes = target.estimate_selection(&resolved);
        let mut along = None;
        let mut step = 1;
        let mut chunks = 1;

        let reference = target.reference(&resolved, options.dimension.as_deref());
        if let (None, Some(dim)) = (&reference, &options.dimension) {
            return Err(Error::DimensionNotFound(dim.clone()));
        }

        if let Some((dims, shape, dtype)) = reference {
            let selections = resolved.for_array(&dims, &shape);
            let candidates: Vec<(usize, &DimSelection)> = selections
                .iter()
                .enumerate()
                .filter(|(_, selection)| !selection.is_scalar())
                .collect();

            let chosen = match &options.dimension {
                Some(dim) => {
                    let axis = dims
                        .iter()
                        .position(|d| d == dim)
                        .ok_or_else(|| Error::DimensionNotFound(dim.clone()))?;
                    if selections[axis].is_scalar() {
                        return Err(Error::InvalidSelection(format!(
                            "can't stream along {dim}, it is selected at a single position"
                        )));
                    }
                    Some(axis)
                }
                None => candidates
                    .iter()
                    .fold(None, |best: Option<(usize, usize)>, &(axis, selection)| {
                        let extent = selection.extent();
                        match best {
                            Some((_, most)) if most >= extent => best,
                            _ => Some((axis, extent)),
                        }
                    })
                    .map(|(axis, _)| axis),
            };

            if let Some(axis) = chosen {
                let others: u64 = candidates
                    .iter()
                    .filter(|(other, _)| *other != axis)
                    .map(|(_, selection)| selection.extent() as u64)
                    .product();
                let budget = (options.chunk_bytes / dtype.byte_width() as u64).max(1);
                step = (budget / others.max(1)).max(1) as usize;

                let extent = selections[axis].extent();
                chunks = ((extent + step - 1) / step).max(1);
                along = Some((dims[axis].clone(), selections[axis].clone()));
            }
        }

        debug!(
            along = ?along.as_ref().map(|(dim, _)| dim),
            step,
            chunks,
            total_bytes,
            "streaming selection"
        );

        Ok(Self {
            target,
            resolved,
            along,
            step,
            chunks,
            next_chunk: 0,
            bytes_processed: 0,
            total_bytes,
            finished: false,
        })
    }

    /// Number of pieces this stream delivers, if nothing fails
    ///
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Fetch the next piece. `None` once every piece has been delivered, or after a failure.
    ///
    pub async fn next(&mut self) -> Option<Result<StreamChunk<T::Output>>> {
        if self.finished || self.next_chunk >= self.chunks {
            return None;
        }

        let chunk = self.next_chunk;
        let mut resolved = self.resolved.clone();
        if let Some((dim, selection)) = &self.along {
            let from = chunk * self.step;
            resolved.insert(dim.clone(), selection.narrow(from, from + self.step));
        }

        trace!(chunk = chunk + 1, chunks = self.chunks, "materializing piece");
        match self.target.materialize_selection(&resolved).await {
            Ok(data) => {
                self.next_chunk += 1;
                self.bytes_processed += self.target.estimate_selection(&resolved);

                Some(Ok(StreamChunk {
                    data,
                    progress: Progress {
                        bytes_processed: self.bytes_processed,
                        total_bytes: self.total_bytes,
                        chunk: chunk + 1,
                        chunks: self.chunks,
                    },
                }))
            }
            Err(err) => {
                debug!(chunk = chunk + 1, %err, "stream aborted");
                self.finished = true;

                Some(Err(err))
            }
        }
    }

    /// Adapt into a `futures::Stream`
    ///
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamChunk<T::Output>>> {
        stream::unfold(self, |mut pieces| async move {
            let piece = pieces.next().await?;

            Some((piece, pieces))
        })
    }
}
