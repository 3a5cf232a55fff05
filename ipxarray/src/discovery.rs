//! Opening a group of arrays in a store as a `Dataset`.
//!
use std::{collections::BTreeMap, ops::Range, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::{future::try_join_all, stream, StreamExt, TryStreamExt};
use ndarray::{ArrayD, IxDyn, Slice};
use tracing::{debug, trace, warn};

use crate::{
    array::{DataArray, Fetch},
    classify::{classify, ArrayOutline},
    codec::{is_encryption_codec, ArrayCodec, ChainCodec},
    coordinate::Coordinate,
    dataset::Dataset,
    errors::{Error, Result},
    geom::{intersect, window_shape, WindowIter},
    key::{join, ChunkKey},
    mapper::Mapper,
    metadata::{ArrayMetadata, Attributes, Node},
    sharded::{ShardedStore, StoreOptions},
    store::ReadableStore,
};

const NODE_DOCUMENT: &str = "zarr.json";

/// How to open a dataset
///
#[derive(Clone)]
pub struct OpenOptions {
    /// Path of the group to open. Empty for the root group.
    pub group: String,

    /// Decoder for chunk bytes
    pub codec: Arc<dyn ArrayCodec>,

    /// Most chunks fetched at once while reading one array
    pub fetch_concurrency: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            group: String::new(),
            codec: Arc::new(ChainCodec),
            fetch_concurrency: 16,
        }
    }
}

impl OpenOptions {
    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = group.into().trim_matches('/').to_string();
        self
    }
}

/// Open the dataset stored in a sharded store rooted at `root`.
///
pub async fn open_sharded(
    root: Cid,
    mapper: Arc<dyn Mapper>,
    store_options: StoreOptions,
    options: OpenOptions,
) -> Result<Dataset> {
    let store = ShardedStore::open_with(root, mapper, store_options).await?;

    open(Arc::new(store), options).await
}

/// Open the group `options.group` of `store` as a dataset.
///
/// Coordinates are read right away. Data variables are lazy: their chunks are only fetched when
/// a selection asks for them.
///
pub async fn open(store: Arc<dyn ReadableStore>, options: OpenOptions) -> Result<Dataset> {
    let group = options.group.trim_matches('/').to_string();
    let prefix = if group.is_empty() {
        String::new()
    } else {
        format!("{group}/")
    };
    let group_document = join(&group, NODE_DOCUMENT);

    let keys = match store.list_metadata_keys() {
        Some(keys) => keys,
        None => store.list_prefix(&prefix).await?,
    };

    // The group's own document and those of its direct children
    let keys: Vec<(Option<String>, String)> = keys
        .into_iter()
        .filter_map(|key| {
            if key == group_document {
                return Some((None, key));
            }
            let name = key
                .strip_prefix(&prefix)?
                .strip_suffix(NODE_DOCUMENT)?
                .strip_suffix('/')?
                .to_string();
            (!name.is_empty() && !name.contains('/')).then(|| (Some(name), key))
        })
        .collect();
    if keys.is_empty() {
        return Err(Error::InvalidMetadata(format!(
            "no metadata documents found for group {group:?}"
        )));
    }

    debug!(group = %group, documents = keys.len(), "discovering dataset");
    let documents = try_join_all(keys.into_iter().map(|(name, key)| {
        let store = Arc::clone(&store);
        async move {
            let document = store.get(&key).await?;
            Ok::<_, Error>((name, key, document))
        }
    }))
    .await?;

    let mut attrs = Attributes::new();
    let mut parsed_any = false;
    let mut arrays: Vec<(String, ArrayMetadata)> = vec![];
    for (name, key, document) in documents {
        let Some(document) = document else {
            warn!(key = %key, "listed metadata document is missing");
            continue;
        };
        match (name, Node::parse(&document)) {
            (None, Ok(Node::Group(group_attrs))) => {
                parsed_any = true;
                attrs = group_attrs;
            }
            (Some(name), Ok(Node::Array(metadata))) => {
                parsed_any = true;
                arrays.push((name, metadata));
            }
            (Some(_), Ok(Node::Group(_))) => {
                // Nested groups aren't part of this dataset
                parsed_any = true;
            }
            (None, Ok(Node::Array(_))) => {
                warn!(key = %key, "group path holds an array");
            }
            (_, Err(err)) => {
                warn!(key = %key, %err, "skipping unreadable metadata document");
            }
        }
    }
    if !parsed_any {
        return Err(Error::InvalidMetadata(format!(
            "no valid array or group metadata in group {group:?}"
        )));
    }

    let outlines: Vec<ArrayOutline> = arrays
        .iter()
        .map(|(name, metadata)| ArrayOutline {
            name: name.clone(),
            dims: metadata.dimension_names.clone(),
        })
        .collect();
    let classification = classify(&outlines);
    let arrays: BTreeMap<String, ArrayMetadata> = arrays.into_iter().collect();

    let fetcher = |name: &str, metadata: &ArrayMetadata| {
        Arc::new(ZarrArrayFetch {
            store: Arc::clone(&store),
            path: join(&group, name),
            metadata: metadata.clone(),
            codec: Arc::clone(&options.codec),
            concurrency: options.fetch_concurrency,
        })
    };

    // Coordinates are read in full
    let coordinate_values = try_join_all(classification.coordinates.iter().map(|name| {
        let metadata = &arrays[name];
        let fetch = fetcher(name.as_str(), metadata);
        async move {
            let window: Vec<Range<usize>> = metadata.shape.iter().map(|&size| 0..size).collect();
            let values = fetch.fetch(&window).await?;
            Ok::<_, Error>((name.clone(), values))
        }
    }))
    .await?;

    let mut dataset = Dataset::new().with_attrs(attrs);
    let mut promoted = BTreeMap::new();
    for (name, values) in coordinate_values {
        let metadata = &arrays[&name];
        let labels: Vec<f64> = values.iter().copied().collect();
        let coord = Coordinate::from_values(
            name.as_str(),
            &labels,
            metadata.data_type,
            metadata.attributes.clone(),
        );
        dataset.add_coordinate(coord)?;
        promoted.insert(name, values);
    }

    for name in &classification.variables {
        let metadata = &arrays[name];
        let array = match promoted.remove(name) {
            Some(values) if classification.promoted => {
                DataArray::from_array(&metadata.dimension_names, values)?
            }
            _ => DataArray::lazy(
                &metadata.dimension_names,
                metadata.shape.clone(),
                metadata.data_type,
                fetcher(name.as_str(), metadata),
            )?,
        };
        let array = array
            .with_dtype(metadata.data_type)
            .with_attrs(metadata.attributes.clone());
        dataset.add_variable(name.as_str(), array)?;
    }

    let encrypted = arrays
        .values()
        .flat_map(|metadata| &metadata.codecs)
        .any(|codec| is_encryption_codec(&codec.name));
    if encrypted {
        debug!(group = %group, "dataset has encrypted variables");
    }
    dataset.set_encrypted(encrypted);

    debug!(
        group = %group,
        coordinates = classification.coordinates.len(),
        variables = classification.variables.len(),
        "opened dataset"
    );

    Ok(dataset)
}

/// Reads windows of one array from a store, chunk by chunk
///
struct ZarrArrayFetch {
    store: Arc<dyn ReadableStore>,
    path: String,
    metadata: ArrayMetadata,
    codec: Arc<dyn ArrayCodec>,
    concurrency: usize,
}

impl ZarrArrayFetch {
    async fn fetch_chunk(&self, coords: Vec<usize>) -> Result<(Vec<usize>, Option<ArrayD<f64>>)> {
        let key = ChunkKey::new(self.path.as_str(), coords.clone()).encode();
        trace!(key = %key, "fetching chunk");

        match self.store.get(&key).await? {
            None => Ok((coords, None)),
            Some(data) => {
                let chunk = self.decode(&data)?;
                Ok((coords, Some(chunk)))
            }
        }
    }

    fn decode(&self, data: &Bytes) -> Result<ArrayD<f64>> {
        let values = self.codec.decode(data, &self.metadata)?;

        ArrayD::from_shape_vec(IxDyn(&self.metadata.chunk_shape), values)
            .map_err(|err| Error::Decode(format!("{}: {err}", self.path)))
    }
}

#[async_trait]
impl Fetch for ZarrArrayFetch {
    async fn fetch(&self, window: &[Range<usize>]) -> Result<ArrayD<f64>> {
        let shape = window_shape(window);
        let mut out = ArrayD::from_elem(IxDyn(&shape), self.metadata.fill_value);
        if shape.iter().any(|&extent| extent == 0) {
            return Ok(out);
        }

        let chunk_shape = &self.metadata.chunk_shape;
        let chunk_window: Vec<Range<usize>> = window
            .iter()
            .zip(chunk_shape)
            .map(|(range, &extent)| range.start / extent..(range.end - 1) / extent + 1)
            .collect();

        let chunks: Vec<(Vec<usize>, Option<ArrayD<f64>>)> =
            stream::iter(WindowIter::new(chunk_window).map(|coords| self.fetch_chunk(coords)))
                .buffer_unordered(self.concurrency.max(1))
                .try_collect()
                .await?;

        for (coords, chunk) in chunks {
            let Some(chunk) = chunk else {
                continue;
            };
            let region: Vec<Range<usize>> = coords
                .iter()
                .zip(chunk_shape)
                .map(|(&coord, &extent)| coord * extent..(coord + 1) * extent)
                .collect();
            let Some(overlap) = window
                .iter()
                .zip(&region)
                .map(|(window, region)| intersect(window, region))
                .collect::<Option<Vec<_>>>()
            else {
                continue;
            };

            let source = chunk.slice_each_axis(|axis| {
                let i = axis.axis.index();
                Slice::from(overlap[i].start - region[i].start..overlap[i].end - region[i].start)
            });
            out.slice_each_axis_mut(|axis| {
                let i = axis.axis.index();
                Slice::from(overlap[i].start - window[i].start..overlap[i].end - window[i].start)
            })
            .assign(&source);
        }

        Ok(out)
    }
}
