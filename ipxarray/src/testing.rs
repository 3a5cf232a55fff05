use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cid::{multihash::MultihashGeneric, Cid};
use multihash::{Hasher, Sha2_256};
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::{
    errors::{Error, Result},
    geom::WindowIter,
    key::ChunkKey,
    mapper::{ByteRange, ContentCodec, Mapper},
    metadata::{ArrayMetadata, Attributes, DataType},
    root::chunk_grid,
    writer::{encode_chunk, DatasetWriter},
};

/// The SHA_256 multicodec code
const SHA2_256: u64 = 0x12;

/// A test implementation of Mapper that stores objects in RAM and counts loads
///
pub(crate) struct MemoryMapper {
    objects: Mutex<HashMap<Cid, Bytes>>,
    hidden: Mutex<HashSet<Cid>>,
    loads: Mutex<HashMap<Cid, usize>>,
    total_loads: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryMapper {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            hidden: Mutex::new(HashSet::new()),
            loads: Mutex::new(HashMap::new()),
            total_loads: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Every load sleeps for `millis` before answering
    pub(crate) fn with_latency(millis: u64) -> Self {
        Self {
            latency: Some(Duration::from_millis(millis)),
            ..Self::new()
        }
    }

    pub(crate) fn total_loads(&self) -> usize {
        self.total_loads.load(Ordering::SeqCst)
    }

    pub(crate) fn loads_of(&self, cid: &Cid) -> usize {
        self.loads.lock().get(cid).copied().unwrap_or(0)
    }

    /// Make an object look missing until `unhide` is called
    pub(crate) fn hide(&self, cid: &Cid) {
        self.hidden.lock().insert(*cid);
    }

    pub(crate) fn unhide(&self, cid: &Cid) {
        self.hidden.lock().remove(cid);
    }
}

#[async_trait]
impl Mapper for MemoryMapper {
    async fn save(&self, data: Bytes, codec: ContentCodec) -> Result<Cid> {
        let cid = Cid::new_v1(codec.code(), digest(&data));
        self.objects.lock().insert(cid, data);

        Ok(cid)
    }

    async fn load(&self, cid: &Cid, range: ByteRange) -> Result<Bytes> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.total_loads.fetch_add(1, Ordering::SeqCst);
        *self.loads.lock().entry(*cid).or_default() += 1;

        if self.hidden.lock().contains(cid) {
            return Err(Error::NotFound(*cid));
        }
        let object = self.objects.lock().get(cid).cloned();
        match object {
            Some(object) => Ok(range.slice(&object)),
            None => Err(Error::NotFound(*cid)),
        }
    }
}

fn digest(data: &[u8]) -> MultihashGeneric<64> {
    let mut hash = Sha2_256::default();
    hash.update(data);

    let digest = hash.finalize();
    MultihashGeneric::wrap(SHA2_256, digest).expect("32 byte digest fits")
}

pub(crate) fn cid_for(data: &str) -> Cid {
    Cid::new_v1(ContentCodec::Raw.code(), digest(data.as_bytes()))
}

/// Attributes from a JSON object literal
pub(crate) fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        other => panic!("attributes must be an object, got {other}"),
    }
}

/// Encoded chunks of `data` keyed by chunk key, leaving out chunks of nothing but fill
///
pub(crate) fn encode_chunks(
    path: &str,
    metadata: &ArrayMetadata,
    data: &ArrayD<f64>,
) -> Vec<(String, Bytes)> {
    let grid = chunk_grid(&metadata.shape, &metadata.chunk_shape);
    WindowIter::new(grid.iter().map(|&extent| 0..extent).collect())
        .filter_map(|coords| {
            let chunk = encode_chunk(metadata, data, &coords).expect("encodable chunk")?;
            Some((ChunkKey::new(path, coords).encode(), chunk))
        })
        .collect()
}

pub(crate) const WEATHER_TIMES: usize = 8;
pub(crate) const WEATHER_LATS: usize = 3;
pub(crate) const WEATHER_LONS: usize = 5;

/// Value of `precip` at a point of the weather dataset. `temp` is this less 50.
///
pub(crate) fn weather_value(time: usize, lat: usize, lon: usize) -> f64 {
    (time * 100 + lat * 10 + lon) as f64 / 4.0
}

/// Write a small gridded dataset: daily `precip` and `temp` over `time`, `lat` and `lon`,
/// starting 2001-01-01.
///
pub(crate) async fn weather_dataset(mapper: &Arc<MemoryMapper>) -> Result<Cid> {
    let mut writer = DatasetWriter::new(Arc::clone(mapper) as Arc<dyn Mapper>, 4);
    writer
        .add_group("", attrs(json!({"title": "weather"})))
        .await?;

    let time = ArrayMetadata::new(vec![WEATHER_TIMES], vec![4], DataType::Int64)
        .with_dimension_names(&["time"])
        .with_attributes(attrs(json!({"units": "days since 2001-01-01"})));
    let days = ArrayD::from_shape_fn(IxDyn(&[WEATHER_TIMES]), |i| i[0] as f64);
    writer.add_array("time", &time, &days).await?;

    let lat = ArrayMetadata::new(vec![WEATHER_LATS], vec![WEATHER_LATS], DataType::Float64)
        .with_dimension_names(&["lat"]);
    let lats = ArrayD::from_shape_fn(IxDyn(&[WEATHER_LATS]), |i| 40.0 + i[0] as f64 * 0.5);
    writer.add_array("lat", &lat, &lats).await?;

    let lon = ArrayMetadata::new(vec![WEATHER_LONS], vec![WEATHER_LONS], DataType::Float64)
        .with_dimension_names(&["lon"]);
    let lons = ArrayD::from_shape_fn(IxDyn(&[WEATHER_LONS]), |i| -100.0 + i[0] as f64 * 0.5);
    writer.add_array("lon", &lon, &lons).await?;

    let shape = vec![WEATHER_TIMES, WEATHER_LATS, WEATHER_LONS];
    for (name, offset) in [("precip", 0.0), ("temp", -50.0)] {
        let metadata = ArrayMetadata::new(shape.clone(), vec![2, 2, 2], DataType::Float32)
            .with_dimension_names(&["time", "lat", "lon"])
            .with_attributes(attrs(json!({"long_name": name})));
        let data = ArrayD::from_shape_fn(IxDyn(&shape), |i| {
            weather_value(i[0], i[1], i[2]) + offset
        });
        writer.add_array(name, &metadata, &data).await?;
    }

    writer.finish().await
}
