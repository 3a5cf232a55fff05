use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

use crate::errors::{Error, Result};

/// Multicodec code for raw binary content
pub const CODEC_RAW: u64 = 0x55;

/// Multicodec code for DAG-CBOR
pub const CODEC_DAG_CBOR: u64 = 0x71;

/// Multicodec code for DAG-JSON
pub const CODEC_DAG_JSON: u64 = 0x0129;

/// How content should be interpreted by the store when it is saved.
///
/// The codec ends up as the codec tag of the returned CID.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentCodec {
    Raw,
    DagCbor,
    DagJson,
}

impl ContentCodec {
    pub fn code(&self) -> u64 {
        match self {
            ContentCodec::Raw => CODEC_RAW,
            ContentCodec::DagCbor => CODEC_DAG_CBOR,
            ContentCodec::DagJson => CODEC_DAG_JSON,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContentCodec::Raw => "raw",
            ContentCodec::DagCbor => "dag-cbor",
            ContentCodec::DagJson => "dag-json",
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            CODEC_RAW => Some(ContentCodec::Raw),
            CODEC_DAG_CBOR => Some(ContentCodec::DagCbor),
            CODEC_DAG_JSON => Some(ContentCodec::DagJson),
            _ => None,
        }
    }
}

/// Which bytes of an object to load.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ByteRange {
    #[default]
    Full,

    /// Everything from `offset` to the end
    From { offset: u64 },

    /// `length` bytes starting at `offset`
    Range { offset: u64, length: u64 },

    /// The last `n` bytes
    Suffix(u64),
}

impl ByteRange {
    /// Build a range from the optional offset/length/suffix triple callers tend to carry around.
    ///
    /// A suffix takes precedence over offset and length.
    ///
    pub fn new(offset: Option<u64>, length: Option<u64>, suffix: Option<u64>) -> Self {
        match (offset, length, suffix) {
            (_, _, Some(n)) => ByteRange::Suffix(n),
            (Some(offset), Some(length), None) => ByteRange::Range { offset, length },
            (None, Some(length), None) => ByteRange::Range { offset: 0, length },
            (Some(offset), None, None) => ByteRange::From { offset },
            (None, None, None) => ByteRange::Full,
        }
    }

    /// Value for an HTTP `Range` header, `None` for the whole object.
    ///
    pub fn http_header(&self) -> Option<String> {
        match self {
            ByteRange::Full => None,
            ByteRange::From { offset } => Some(format!("bytes={offset}-")),
            ByteRange::Range { offset, length } => {
                Some(format!("bytes={offset}-{}", offset + length.saturating_sub(1)))
            }
            ByteRange::Suffix(n) => Some(format!("bytes=-{n}")),
        }
    }

    /// Apply this range to an object already held in memory.
    ///
    pub fn slice(&self, object: &Bytes) -> Bytes {
        let len = object.len() as u64;
        let (start, end) = match *self {
            ByteRange::Full => (0, len),
            ByteRange::From { offset } => (offset.min(len), len),
            ByteRange::Range { offset, length } => {
                (offset.min(len), offset.saturating_add(length).min(len))
            }
            ByteRange::Suffix(n) => (len.saturating_sub(n), len),
        };

        object.slice(start as usize..end as usize)
    }
}

/// A pin known to the management endpoint
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pin {
    pub cid: Cid,
    pub kind: String,
}

/// A trait for storing and loading content from an arbitrary content-addressed store.
///
/// Implementations are responsible for their own transport concerns (retries, admission
/// control). Callers only see the final outcome: `NotFound` when the store definitively does not
/// have an object, `FetchFailed` when it could not be reached.
///
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Hash and store `data`, returning its CID.
    ///
    /// Fails with `StoreReadOnly` if the store cannot be written to.
    ///
    async fn save(&self, data: Bytes, codec: ContentCodec) -> Result<Cid>;

    /// Load all or part of the object identified by `cid`.
    ///
    async fn load(&self, cid: &Cid, range: ByteRange) -> Result<Bytes>;

    async fn pin(&self, _cid: &Cid) -> Result<()> {
        Err(Error::NotSupported("pin".into()))
    }

    async fn unpin(&self, _cid: &Cid) -> Result<()> {
        Err(Error::NotSupported("unpin".into()))
    }

    /// Move a pin from `from` to `to`.
    ///
    async fn pin_update(&self, _from: &Cid, _to: &Cid) -> Result<()> {
        Err(Error::NotSupported("pin update".into()))
    }

    async fn pin_ls(&self) -> Result<Vec<Pin>> {
        Err(Error::NotSupported("pin listing".into()))
    }
}
