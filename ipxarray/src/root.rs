use std::{collections::BTreeMap, str::FromStr};

use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    geom::ravel,
};

pub(crate) const ROOT_FORMAT: &str = "ipxarray-sharded";
pub(crate) const ROOT_VERSION: u32 = 1;

/// The serialized form of a sharded store's root descriptor.
///
/// CIDs are kept as strings here and validated by `RootDescriptor::validate`.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RootDocument {
    pub format: String,
    pub version: u32,

    /// Metadata document key to CID of the document
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Array path to that array's chunk index
    #[serde(default)]
    pub arrays: BTreeMap<String, GridDocument>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct GridDocument {
    pub shape: Vec<usize>,
    pub chunk_shape: Vec<usize>,
    pub chunks_per_shard: usize,
    pub shards: Vec<String>,
}

/// A validated root descriptor
///
#[derive(Clone, Debug)]
pub(crate) struct RootDescriptor {
    pub metadata: BTreeMap<String, Cid>,
    pub arrays: BTreeMap<String, GridIndex>,
}

impl RootDescriptor {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let document: RootDocument = serde_json::from_slice(data)
            .map_err(|err| Error::InvalidRoot(format!("unparsable root descriptor: {err}")))?;

        Self::validate(document)
    }

    fn validate(document: RootDocument) -> Result<Self> {
        if document.format != ROOT_FORMAT {
            return Err(Error::InvalidRoot(format!(
                "unrecognized format {:?}",
                document.format
            )));
        }
        if document.version != ROOT_VERSION {
            return Err(Error::InvalidRoot(format!(
                "unsupported version {}",
                document.version
            )));
        }

        let metadata = document
            .metadata
            .into_iter()
            .map(|(key, cid)| Ok((key, parse_cid(&cid)?)))
            .collect::<Result<_>>()?;

        let arrays = document
            .arrays
            .into_iter()
            .map(|(path, grid)| {
                let grid = GridIndex::new(
                    grid.shape,
                    grid.chunk_shape,
                    grid.chunks_per_shard,
                    grid.shards
                        .iter()
                        .map(|cid| parse_cid(cid))
                        .collect::<Result<_>>()?,
                )
                .map_err(|err| match err {
                    Error::InvalidRoot(reason) => Error::InvalidRoot(format!("{path}: {reason}")),
                    err => err,
                })?;

                Ok((path, grid))
            })
            .collect::<Result<_>>()?;

        Ok(Self { metadata, arrays })
    }
}

fn parse_cid(cid: &str) -> Result<Cid> {
    Cid::from_str(cid).map_err(|err| Error::InvalidRoot(format!("bad CID {cid:?}: {err}")))
}

/// The two level chunk index of one array.
///
/// The flat chunk index space of the array, in row-major order over its chunk grid, is cut into
/// consecutive runs of `chunks_per_shard` entries, each run stored as one shard.
///
#[derive(Clone, Debug, PartialEq)]
pub struct GridIndex {
    shape: Vec<usize>,
    chunk_shape: Vec<usize>,
    chunks_per_shard: usize,
    shards: Vec<Cid>,

    /// Number of chunks along each dimension
    grid: Vec<usize>,
    total_chunks: usize,
}

impl GridIndex {
    pub fn new(
        shape: Vec<usize>,
        chunk_shape: Vec<usize>,
        chunks_per_shard: usize,
        shards: Vec<Cid>,
    ) -> Result<Self> {
        if shape.len() != chunk_shape.len() {
            return Err(Error::InvalidRoot(format!(
                "shape {shape:?} and chunk shape {chunk_shape:?} differ in rank"
            )));
        }
        if chunk_shape.iter().any(|&extent| extent == 0) {
            return Err(Error::InvalidRoot(format!(
                "chunk shape {chunk_shape:?} has a zero extent"
            )));
        }
        if chunks_per_shard == 0 {
            return Err(Error::InvalidRoot("chunks per shard must be positive".into()));
        }

        let grid = chunk_grid(&shape, &chunk_shape);
        let total_chunks = grid.iter().product();
        let expected = shard_count(total_chunks, chunks_per_shard);
        if shards.len() != expected {
            return Err(Error::InvalidRoot(format!(
                "{total_chunks} chunks at {chunks_per_shard} per shard needs {expected} shards, \
                 found {}",
                shards.len()
            )));
        }

        Ok(Self {
            shape,
            chunk_shape,
            chunks_per_shard,
            shards,
            grid,
            total_chunks,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunk_shape
    }

    pub fn chunks_per_shard(&self) -> usize {
        self.chunks_per_shard
    }

    /// Number of chunks along each dimension
    pub fn grid(&self) -> &[usize] {
        &self.grid
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn shard_cid(&self, shard_index: usize) -> Option<&Cid> {
        self.shards.get(shard_index)
    }

    /// Row-major flat index of a chunk. `None` if the chunk is outside the grid.
    ///
    pub fn linearize(&self, coords: &[usize]) -> Option<usize> {
        let inside = coords.len() == self.grid.len()
            && coords.iter().zip(&self.grid).all(|(&coord, &extent)| coord < extent);

        inside.then(|| ravel(coords, &self.grid))
    }

    /// Split a flat chunk index into `(shard index, offset in shard)`.
    ///
    pub fn locate(&self, flat: usize) -> (usize, usize) {
        (flat / self.chunks_per_shard, flat % self.chunks_per_shard)
    }

    /// Number of entries stored in shard `shard_index`. The last shard may be short.
    ///
    pub fn shard_len(&self, shard_index: usize) -> usize {
        let start = shard_index * self.chunks_per_shard;
        self.total_chunks
            .saturating_sub(start)
            .min(self.chunks_per_shard)
    }
}

pub(crate) fn chunk_grid(shape: &[usize], chunk_shape: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .zip(chunk_shape)
        .map(|(&extent, &chunk)| (extent + chunk - 1) / chunk)
        .collect()
}

pub(crate) fn shard_count(total_chunks: usize, chunks_per_shard: usize) -> usize {
    (total_chunks + chunks_per_shard - 1) / chunks_per_shard
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing;

    fn shards(n: usize) -> Vec<Cid> {
        (0..n).map(|i| testing::cid_for(&format!("shard {i}"))).collect()
    }

    #[test]
    fn test_grid_index() -> Result<()> {
        // 3 x 4 x 2 chunks = 24, at 5 per shard = 5 shards
        let index = GridIndex::new(vec![30, 40, 3], vec![10, 10, 2], 5, shards(5))?;
        assert_eq!(index.grid(), &[3, 4, 2]);
        assert_eq!(index.total_chunks(), 24);
        assert_eq!(index.linearize(&[0, 0, 0]), Some(0));
        assert_eq!(index.linearize(&[0, 0, 1]), Some(1));
        assert_eq!(index.linearize(&[0, 1, 0]), Some(2));
        assert_eq!(index.linearize(&[1, 0, 0]), Some(8));
        assert_eq!(index.linearize(&[2, 3, 1]), Some(23));
        assert_eq!(index.linearize(&[3, 0, 0]), None);
        assert_eq!(index.linearize(&[0, 0]), None);
        assert_eq!(index.locate(23), (4, 3));
        assert_eq!(index.shard_len(0), 5);
        assert_eq!(index.shard_len(4), 4);

        Ok(())
    }

    #[test]
    fn test_locate_covers_every_chunk() -> Result<()> {
        for chunks_per_shard in [1, 2, 3, 7, 24, 100] {
            let n_shards = shard_count(24, chunks_per_shard);
            let index =
                GridIndex::new(vec![6, 8], vec![1, 2], chunks_per_shard, shards(n_shards))?;
            for row in 0..6 {
                for col in 0..4 {
                    let flat = index.linearize(&[row, col]).expect("in grid");
                    let (shard, offset) = index.locate(flat);
                    assert_eq!(shard * chunks_per_shard + offset, flat);
                    assert!(offset < chunks_per_shard);
                    assert!(offset < index.shard_len(shard));
                }
            }
        }

        Ok(())
    }

    #[test]
    fn test_invalid_grids() {
        let invalid = |result: Result<GridIndex>| matches!(result, Err(Error::InvalidRoot(_)));
        assert!(invalid(GridIndex::new(vec![10, 10], vec![5], 1, shards(2))));
        assert!(invalid(GridIndex::new(vec![10], vec![0], 1, shards(1))));
        assert!(invalid(GridIndex::new(vec![10], vec![5], 0, shards(1))));
        assert!(invalid(GridIndex::new(vec![10], vec![5], 1, shards(3))));
    }

    #[test]
    fn test_parse_root() -> Result<()> {
        let cid = testing::cid_for("doc").to_string();
        let root = format!(
            r#"{{"format": "ipxarray-sharded", "version": 1,
                "metadata": {{"zarr.json": "{cid}"}},
                "arrays": {{"x": {{"shape": [4], "chunk_shape": [2],
                                 "chunks_per_shard": 2, "shards": ["{cid}"]}}}}}}"#
        );
        let root = RootDescriptor::parse(root.as_bytes())?;
        assert_eq!(root.metadata.len(), 1);
        assert_eq!(root.arrays["x"].total_chunks(), 2);

        let missing = r#"{"format": "ipxarray-sharded"}"#;
        assert!(matches!(
            RootDescriptor::parse(missing.as_bytes()),
            Err(Error::InvalidRoot(_))
        ));

        let wrong = r#"{"format": "something-else", "version": 1}"#;
        assert!(matches!(
            RootDescriptor::parse(wrong.as_bytes()),
            Err(Error::InvalidRoot(_))
        ));

        let bad_cid = r#"{"format": "ipxarray-sharded", "version": 1,
                          "metadata": {"zarr.json": "not a cid"}}"#;
        assert!(matches!(
            RootDescriptor::parse(bad_cid.as_bytes()),
            Err(Error::InvalidRoot(_))
        ));

        Ok(())
    }
}
