//! Writing datasets into a content-addressed block store as sharded stores.
//!
use std::{collections::BTreeMap, ops::Range, sync::Arc};

use bytes::Bytes;
use cid::Cid;
use futures::{stream, StreamExt, TryStreamExt};
use ndarray::{ArrayD, IxDyn, Slice};
use serde_json::json;
use tracing::debug;

use crate::{
    codec::ChainCodec,
    errors::{Error, Result},
    geom::{intersect, WindowIter},
    key::metadata_key,
    mapper::{ContentCodec, Mapper},
    metadata::{ArrayMetadata, Attributes},
    root::{chunk_grid, GridDocument, RootDocument, ROOT_FORMAT, ROOT_VERSION},
    shard::Shard,
};

/// Most blocks saved at once
const SAVE_CONCURRENCY: usize = 16;

/// Builds a sharded store one node at a time.
///
/// Every chunk and shard is saved to the mapper as soon as its array is added. Nothing is
/// reachable until `finish` saves the root descriptor that ties it all together.
///
pub struct DatasetWriter {
    mapper: Arc<dyn Mapper>,
    chunks_per_shard: usize,
    metadata: BTreeMap<String, Cid>,
    arrays: BTreeMap<String, GridDocument>,
}

impl DatasetWriter {
    pub fn new(mapper: Arc<dyn Mapper>, chunks_per_shard: usize) -> Self {
        Self {
            mapper,
            chunks_per_shard: chunks_per_shard.max(1),
            metadata: BTreeMap::new(),
            arrays: BTreeMap::new(),
        }
    }

    /// Save a metadata document under `key`.
    ///
    pub async fn add_metadata<S, B>(&mut self, key: S, document: B) -> Result<Cid>
    where
        S: Into<String>,
        B: Into<Bytes>,
    {
        let cid = self.mapper.save(document.into(), ContentCodec::Raw).await?;
        self.metadata.insert(key.into(), cid);

        Ok(cid)
    }

    /// Save the metadata document of the group at `path`.
    ///
    pub async fn add_group(&mut self, path: &str, attributes: Attributes) -> Result<Cid> {
        let document = json!({
            "zarr_format": 3,
            "node_type": "group",
            "attributes": attributes,
        });

        self.add_metadata(metadata_key(path), serde_json::to_vec(&document)?)
            .await
    }

    /// Chunk, encode and save `data` as the array at `path`.
    ///
    /// Edge chunks are padded with the fill value. Chunks holding nothing but the fill value are
    /// left out of the index.
    ///
    pub async fn add_array(
        &mut self,
        path: &str,
        metadata: &ArrayMetadata,
        data: &ArrayD<f64>,
    ) -> Result<()> {
        if data.shape() != metadata.shape.as_slice() {
            return Err(Error::ShapeMismatch(format!(
                "{path}: data has shape {:?}, metadata says {:?}",
                data.shape(),
                metadata.shape
            )));
        }
        if metadata.chunk_shape.len() != metadata.rank()
            || metadata.dimension_names.len() != metadata.rank()
        {
            return Err(Error::InvalidMetadata(format!(
                "{path}: chunk shape and dimension names must match rank {}",
                metadata.rank()
            )));
        }

        let grid = chunk_grid(&metadata.shape, &metadata.chunk_shape);
        let mut chunks = vec![];
        for coords in WindowIter::new(grid.iter().map(|&extent| 0..extent).collect()) {
            chunks.push(encode_chunk(metadata, data, &coords)?);
        }

        self.add_metadata(metadata_key(path), serde_json::to_vec(&metadata.to_json())?)
            .await?;
        self.add_raw_chunks(
            path,
            metadata.shape.clone(),
            metadata.chunk_shape.clone(),
            chunks,
        )
        .await
    }

    /// Save already encoded chunks for the array at `path`, in row-major order of its chunk
    /// grid. `None` marks a chunk that was never written.
    ///
    pub async fn add_raw_chunks(
        &mut self,
        path: &str,
        shape: Vec<usize>,
        chunk_shape: Vec<usize>,
        chunks: Vec<Option<Bytes>>,
    ) -> Result<()> {
        if shape.len() != chunk_shape.len() || chunk_shape.iter().any(|&extent| extent == 0) {
            return Err(Error::ShapeMismatch(format!(
                "{path}: bad chunk shape {chunk_shape:?} for shape {shape:?}"
            )));
        }
        let total: usize = chunk_grid(&shape, &chunk_shape).iter().product();
        if chunks.len() != total {
            return Err(Error::ShapeMismatch(format!(
                "{path}: expected {total} chunks, got {}",
                chunks.len()
            )));
        }

        let entries: Vec<Option<Cid>> = self.save_all(chunks).await?;
        let shards = entries
            .chunks(self.chunks_per_shard)
            .map(|entries| Shard::new(entries.to_vec()).encode().map(Some))
            .collect::<Result<Vec<_>>>()?;
        let shards = self
            .save_all(shards)
            .await?
            .into_iter()
            .flatten()
            .map(|cid| cid.to_string())
            .collect();

        debug!(
            path,
            chunks = total,
            written = entries.iter().flatten().count(),
            "added array"
        );
        self.arrays.insert(
            path.to_string(),
            GridDocument {
                shape,
                chunk_shape,
                chunks_per_shard: self.chunks_per_shard,
                shards,
            },
        );

        Ok(())
    }

    /// Save the root descriptor, returning the CID to open the store with.
    ///
    pub async fn finish(self) -> Result<Cid> {
        let root = RootDocument {
            format: ROOT_FORMAT.to_string(),
            version: ROOT_VERSION,
            metadata: self
                .metadata
                .iter()
                .map(|(key, cid)| (key.clone(), cid.to_string()))
                .collect(),
            arrays: self.arrays,
        };
        let root = serde_json::to_vec(&root)?;
        let cid = self.mapper.save(root.into(), ContentCodec::Raw).await?;
        debug!(%cid, documents = self.metadata.len(), "saved root descriptor");

        Ok(cid)
    }

    async fn save_all(&self, blocks: Vec<Option<Bytes>>) -> Result<Vec<Option<Cid>>> {
        stream::iter(blocks.into_iter().map(|block| {
            let mapper = Arc::clone(&self.mapper);
            async move {
                let cid = match block {
                    None => None,
                    Some(block) => Some(mapper.save(block, ContentCodec::Raw).await?),
                };
                Ok::<_, Error>(cid)
            }
        }))
        .buffered(SAVE_CONCURRENCY)
        .try_collect()
        .await
    }
}

/// Encode the chunk at `coords` of `data`, `None` if it holds only the fill value.
///
pub(crate) fn encode_chunk(
    metadata: &ArrayMetadata,
    data: &ArrayD<f64>,
    coords: &[usize],
) -> Result<Option<Bytes>> {
    let region: Vec<Range<usize>> = coords
        .iter()
        .zip(&metadata.chunk_shape)
        .map(|(&coord, &extent)| coord * extent..(coord + 1) * extent)
        .collect();
    let overlap: Vec<Range<usize>> = region
        .iter()
        .zip(&metadata.shape)
        .map(|(region, &size)| intersect(region, &(0..size)).unwrap_or(0..0))
        .collect();

    let mut chunk = ArrayD::from_elem(IxDyn(&metadata.chunk_shape), metadata.fill_value);
    chunk
        .slice_each_axis_mut(|axis| {
            let i = axis.axis.index();
            Slice::from(0..overlap[i].len())
        })
        .assign(&data.slice_each_axis(|axis| Slice::from(overlap[axis.axis.index()].clone())));

    let fill = metadata.fill_value;
    if chunk
        .iter()
        .all(|&value| value == fill || (value.is_nan() && fill.is_nan()))
    {
        return Ok(None);
    }

    let values: Vec<f64> = chunk.iter().copied().collect();
    let encoded = ChainCodec.encode(&values, metadata)?;

    Ok(Some(encoded.into()))
}
