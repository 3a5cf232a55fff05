use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::{future::try_join_all, FutureExt};
use tracing::{debug, trace};

use crate::{
    cache::Cache,
    errors::{Error, Result},
    key::{is_metadata_key, ChunkKey},
    mapper::{ByteRange, Mapper},
    root::{GridIndex, RootDescriptor},
    shard::Shard,
    store::ReadableStore,
};

/// Tuning for a `ShardedStore`
///
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Byte budget for the LRU cache of chunk bytes. Zero disables caching of chunks.
    pub block_cache_bytes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_cache_bytes: 256 << 20,
        }
    }
}

/// A read-only store over a content-addressed block store.
///
/// Metadata documents are fetched when the store is opened. Chunks are found through a two level
/// index per array: a chunk's flat index in the array's chunk grid picks a shard and an offset in
/// that shard, and the shard entry at that offset is the CID of the chunk's bytes.
///
/// Shards are loaded on first use and kept for the life of the store. Concurrent requests that
/// need the same shard share a single load.
///
pub struct ShardedStore {
    root: Cid,
    mapper: Arc<dyn Mapper>,
    documents: BTreeMap<String, Bytes>,
    arrays: BTreeMap<String, GridIndex>,
    shards: Cache<(String, usize), Shard>,
    blocks: Cache<Cid, Bytes>,
}

impl ShardedStore {
    /// Open the store whose root descriptor is `root`, with default options.
    ///
    pub async fn open(root: Cid, mapper: Arc<dyn Mapper>) -> Result<Self> {
        Self::open_with(root, mapper, StoreOptions::default()).await
    }

    pub async fn open_with(
        root: Cid,
        mapper: Arc<dyn Mapper>,
        options: StoreOptions,
    ) -> Result<Self> {
        debug!(%root, "opening sharded store");
        let descriptor = mapper.load(&root, ByteRange::Full).await?;
        let descriptor = RootDescriptor::parse(&descriptor)?;

        let documents = try_join_all(descriptor.metadata.iter().map(|(key, cid)| {
            let mapper = Arc::clone(&mapper);
            async move {
                let document = mapper.load(cid, ByteRange::Full).await?;
                Ok::<_, Error>((key.clone(), document))
            }
        }))
        .await?
        .into_iter()
        .collect();

        debug!(
            %root,
            documents = descriptor.metadata.len(),
            arrays = descriptor.arrays.len(),
            "opened sharded store"
        );

        Ok(Self {
            root,
            mapper,
            documents,
            arrays: descriptor.arrays,
            shards: Cache::unbounded(),
            blocks: Cache::new(options.block_cache_bytes),
        })
    }

    /// CID of this store's root descriptor
    ///
    pub fn root(&self) -> &Cid {
        &self.root
    }

    /// The chunk index for the array at `path`, if it has one
    ///
    pub fn grid(&self, path: &str) -> Option<&GridIndex> {
        self.arrays.get(path)
    }

    /// Get a metadata document or chunk.
    ///
    /// A chunk whose shard entry is absent yields `None`, for the caller to fill in.
    ///
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(document) = self.documents.get(key) {
            return Ok(Some(document.clone()));
        }

        match self.chunk_cid(key).await? {
            None => Ok(None),
            Some(cid) => {
                trace!(key, %cid, "fetching chunk");
                let mapper = Arc::clone(&self.mapper);
                let load = move |cid: Cid| {
                    let mapper = Arc::clone(&mapper);
                    async move { mapper.load(&cid, ByteRange::Full).await }.boxed()
                };
                let block = self.blocks.get(&cid, load).await?;

                Ok(Some(Bytes::clone(&block)))
            }
        }
    }

    /// Whether a metadata document or chunk exists, without fetching any chunk bytes.
    ///
    pub async fn has(&self, key: &str) -> Result<bool> {
        if self.documents.contains_key(key) {
            return Ok(true);
        }

        Ok(self.chunk_cid(key).await?.is_some())
    }

    /// Every metadata document key known to the root descriptor
    ///
    pub fn list_metadata_keys(&self) -> Vec<String> {
        self.documents
            .keys()
            .filter(|key| is_metadata_key(key))
            .cloned()
            .collect()
    }

    pub async fn set(&self, key: &str, _value: Bytes) -> Result<()> {
        Err(Error::ReadOnlyViolation(key.to_string()))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        Err(Error::ReadOnlyViolation(key.to_string()))
    }

    /// Number of shards loaded so far
    ///
    pub fn loaded_shards(&self) -> usize {
        self.shards.len()
    }

    /// Resolve a chunk key to the CID of the chunk's bytes.
    ///
    async fn chunk_cid(&self, key: &str) -> Result<Option<Cid>> {
        if is_metadata_key(key) {
            return Ok(None);
        }
        let Some(chunk) = ChunkKey::parse(key) else {
            return Ok(None);
        };
        let Some(grid) = self.arrays.get(&chunk.array) else {
            trace!(key, "no chunk index for array");
            return Ok(None);
        };
        let Some(flat) = grid.linearize(&chunk.coords) else {
            trace!(key, "chunk is outside of grid");
            return Ok(None);
        };

        let (shard_index, offset) = grid.locate(flat);
        let shard = self.shard(&chunk.array, grid, shard_index).await?;

        Ok(shard.entry(offset).copied())
    }

    async fn shard(&self, array: &str, grid: &GridIndex, shard_index: usize) -> Result<Arc<Shard>> {
        let cid = *grid.shard_cid(shard_index).ok_or_else(|| {
            Error::InvalidRoot(format!("{array}: no shard at index {shard_index}"))
        })?;
        let expected = grid.shard_len(shard_index);
        let mapper = Arc::clone(&self.mapper);
        let load = move |(array, shard_index): (String, usize)| {
            let mapper = Arc::clone(&mapper);
            async move {
                debug!(array = %array, shard_index, %cid, "loading shard");
                let data = mapper.load(&cid, ByteRange::Full).await?;

                Shard::decode(&data, expected)
            }
            .boxed()
        };

        self.shards.get(&(array.to_string(), shard_index), load).await
    }
}

#[async_trait]
impl ReadableStore for ShardedStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        ShardedStore::get(self, key).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        ShardedStore::has(self, key).await
    }

    fn list_metadata_keys(&self) -> Option<Vec<String>> {
        Some(ShardedStore::list_metadata_keys(self))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .list_metadata_keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::future::join_all;

    use crate::{
        mapper::ContentCodec,
        testing::{self, MemoryMapper},
        writer::DatasetWriter,
    };

    async fn store_with_gaps(mapper: &Arc<MemoryMapper>) -> Result<Cid> {
        // 4 x 4 grid of 2 x 2 chunks, 3 chunks per shard
        let mut writer = DatasetWriter::new(Arc::clone(mapper) as Arc<dyn Mapper>, 3);
        writer
            .add_metadata("zarr.json", br#"{"zarr_format": 3, "node_type": "group"}"#.to_vec())
            .await?;
        let chunks = (0..16)
            .map(|i| {
                if i % 5 == 0 {
                    None
                } else {
                    Some(Bytes::from(format!("chunk {i}")))
                }
            })
            .collect();
        writer
            .add_raw_chunks("grid", vec![8, 8], vec![2, 2], chunks)
            .await?;

        writer.finish().await
    }

    #[tokio::test]
    async fn test_get_chunks_and_documents() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::new());
        let root = store_with_gaps(&mapper).await?;
        let store = ShardedStore::open(root, mapper.clone()).await?;

        assert_eq!(store.list_metadata_keys(), vec!["zarr.json"]);
        assert!(store.get("zarr.json").await?.is_some());
        assert!(store.has("zarr.json").await?);

        for i in 0..16_usize {
            let key = ChunkKey::new("grid", vec![i / 4, i % 4]).encode();
            let chunk = store.get(&key).await?;
            if i % 5 == 0 {
                assert_eq!(chunk, None);
                assert!(!store.has(&key).await?);
            } else {
                assert_eq!(chunk, Some(Bytes::from(format!("chunk {i}"))));
                assert!(store.has(&key).await?);
            }
        }
        assert_eq!(store.loaded_shards(), 6);

        assert_eq!(store.get("grid/c/4/0").await?, None);
        assert_eq!(store.get("other/c/0/0").await?, None);
        assert_eq!(store.get("grid/zarr.json").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_has_fetches_no_chunk_bytes() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::new());
        let root = store_with_gaps(&mapper).await?;
        let store = ShardedStore::open(root, mapper.clone()).await?;

        let before = mapper.total_loads();
        assert!(store.has("grid/c/0/1").await?);
        // Just the shard
        assert_eq!(mapper.total_loads(), before + 1);
        assert!(store.has("grid/c/0/2").await?);
        assert_eq!(mapper.total_loads(), before + 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_shard_load() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::with_latency(20));
        let root = store_with_gaps(&mapper).await?;
        let store = ShardedStore::open(root, mapper.clone()).await?;

        // Chunks 1 and 2 both live in shard 0
        let keys = ["grid/c/0/1", "grid/c/0/2", "grid/c/0/1", "grid/c/0/2"];
        let results = join_all(keys.iter().cycle().take(12).map(|key| store.get(key))).await;
        for result in results {
            assert!(result?.is_some());
        }

        let grid = store.grid("grid").expect("grid index");
        let shard_cid = grid.shard_cid(0).expect("shard 0");
        assert_eq!(mapper.loads_of(shard_cid), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_shard_load_is_retried() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::new());
        let root = store_with_gaps(&mapper).await?;
        let store = ShardedStore::open(root, mapper.clone()).await?;
        let shard_cid = *store.grid("grid").and_then(|g| g.shard_cid(0)).expect("shard");

        mapper.hide(&shard_cid);
        assert!(matches!(
            store.get("grid/c/0/1").await,
            Err(Error::NotFound(cid)) if cid == shard_cid
        ));
        assert_eq!(store.loaded_shards(), 0);

        mapper.unhide(&shard_cid);
        assert!(store.get("grid/c/0/1").await?.is_some());
        assert_eq!(store.loaded_shards(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_read_only() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::new());
        let root = store_with_gaps(&mapper).await?;
        let store = ShardedStore::open(root, mapper).await?;

        assert!(matches!(
            store.set("grid/c/0/0", Bytes::new()).await,
            Err(Error::ReadOnlyViolation(_))
        ));
        assert!(matches!(
            store.delete("zarr.json").await,
            Err(Error::ReadOnlyViolation(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_open_invalid_root() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::new());
        let root = mapper
            .save(Bytes::from_static(b"{\"format\": 1}"), ContentCodec::Raw)
            .await?;
        assert!(matches!(
            ShardedStore::open(root, mapper.clone()).await,
            Err(Error::InvalidRoot(_))
        ));

        let missing = testing::cid_for("nothing here");
        assert!(matches!(
            ShardedStore::open(missing, mapper).await,
            Err(Error::NotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_block_cache() -> Result<()> {
        let mapper = Arc::new(MemoryMapper::new());
        let root = store_with_gaps(&mapper).await?;

        let cached = ShardedStore::open(root, mapper.clone()).await?;
        let before = mapper.total_loads();
        let chunk = cached.get("grid/c/0/1").await?;
        assert_eq!(chunk, Some(Bytes::from("chunk 1")));
        // The shard and the block
        assert_eq!(mapper.total_loads(), before + 2);

        let before = mapper.total_loads();
        assert_eq!(cached.get("grid/c/0/1").await?, chunk);
        assert_eq!(mapper.total_loads(), before);

        let uncached = ShardedStore::open_with(
            root,
            mapper.clone(),
            StoreOptions {
                block_cache_bytes: 0,
            },
        )
        .await?;
        uncached.get("grid/c/0/1").await?;
        let before = mapper.total_loads();
        assert_eq!(uncached.get("grid/c/0/1").await?, chunk);
        assert_eq!(mapper.total_loads(), before + 1);

        Ok(())
    }
}
