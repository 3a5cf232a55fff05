mod array;
mod broadcast;
mod cache;
mod classify;
mod codec;
mod concat;
mod coordinate;
mod dataset;
mod discovery;
mod errors;
mod extio;
mod geom;
mod key;
mod label;
mod mapper;
mod metadata;
mod root;
mod selection;
mod shard;
mod sharded;
mod store;
mod stream;
mod writer;

#[cfg(test)]
mod testing;

pub use array::DataArray;
pub use array::Fetch;
pub use array::Source;

pub use broadcast::AttrPolicy;
pub use broadcast::CombineOptions;
pub use broadcast::Operand;

pub use classify::classify;
pub use classify::ArrayOutline;
pub use classify::Classification;

pub use codec::is_encryption_codec;
pub use codec::ArrayCodec;
pub use codec::ChainCodec;

pub use coordinate::Coordinate;
pub use dataset::Dataset;

pub use discovery::open;
pub use discovery::open_sharded;
pub use discovery::OpenOptions;

pub use errors::Error;
pub use errors::Result;

pub use key::ChunkKey;
pub use label::Label;

pub use mapper::ByteRange;
pub use mapper::ContentCodec;
pub use mapper::Mapper;
pub use mapper::Pin;

pub use metadata::ArrayMetadata;
pub use metadata::Attributes;
pub use metadata::CodecSpec;
pub use metadata::DataType;
pub use metadata::Node;

pub use root::GridIndex;
pub use shard::Shard;

pub use selection::DimSelection;
pub use selection::IndexSelection;
pub use selection::Indexer;
pub use selection::LabelIndexer;
pub use selection::MatchPolicy;
pub use selection::ResolvedSelection;
pub use selection::Selection;

pub use sharded::ShardedStore;
pub use sharded::StoreOptions;

pub use store::MemoryStore;
pub use store::ReadableStore;

pub use stream::Materialize;
pub use stream::Progress;
pub use stream::SelectionStream;
pub use stream::StreamChunk;
pub use stream::StreamOptions;

pub use writer::DatasetWriter;
