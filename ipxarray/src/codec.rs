use std::{
    io::{Read, Write},
    mem::size_of,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use num_traits::cast;
use paste::paste;
use serde_json::Value;

use crate::{
    errors::{Error, Result},
    metadata::{ArrayMetadata, CodecSpec, DataType},
};

const ENCRYPTION_CODECS: [&str; 5] = [
    "xchacha20poly1305",
    "xchacha20-poly1305",
    "aes-gcm",
    "aes_gcm",
    "encryption",
];

/// Whether a codec name is one known to indicate encrypted content
///
pub fn is_encryption_codec(name: &str) -> bool {
    ENCRYPTION_CODECS.contains(&name.to_ascii_lowercase().as_str())
}

/// Turns the stored bytes of one chunk into element values.
///
/// Values are handed back as `f64` in row-major order over the chunk shape, whatever the declared
/// data type.
///
pub trait ArrayCodec: Send + Sync {
    fn decode(&self, data: &[u8], metadata: &ArrayMetadata) -> Result<Vec<f64>>;
}

/// The default codec: the `bytes` codec, optionally followed by `gzip` and/or `zstd`.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainCodec;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Endian {
    Little,
    Big,
}

/// A codec chain split into its parts
struct Chain<'a> {
    endian: Endian,
    compressors: &'a [CodecSpec],
}

impl<'a> Chain<'a> {
    fn of(metadata: &'a ArrayMetadata) -> Result<Self> {
        let codecs = &metadata.codecs;
        let Some(at) = codecs.iter().position(|codec| codec.name == "bytes") else {
            return match codecs.first() {
                None => Ok(Self {
                    endian: Endian::Little,
                    compressors: &[],
                }),
                Some(codec) => Err(unsupported(codec)),
            };
        };

        // Array to array codecs would come before `bytes`
        if let Some(codec) = codecs[..at].first() {
            return Err(unsupported(codec));
        }

        let compressors = &codecs[at + 1..];
        if let Some(codec) = compressors
            .iter()
            .find(|codec| !matches!(codec.name.as_str(), "gzip" | "zstd"))
        {
            return Err(unsupported(codec));
        }

        let endian = match codecs[at].configuration.get("endian").and_then(Value::as_str) {
            None | Some("little") => Endian::Little,
            Some("big") => Endian::Big,
            Some(other) => {
                return Err(Error::InvalidMetadata(format!("unknown byte order {other:?}")))
            }
        };

        Ok(Self {
            endian,
            compressors,
        })
    }
}

fn unsupported(codec: &CodecSpec) -> Error {
    Error::NotSupported(format!("codec {}", codec.name))
}

fn level(codec: &CodecSpec, default: i64) -> i64 {
    codec
        .configuration
        .get("level")
        .and_then(Value::as_i64)
        .unwrap_or(default)
}

impl ChainCodec {
    /// Encode the values of one chunk. Used when writing datasets.
    ///
    pub fn encode(&self, values: &[f64], metadata: &ArrayMetadata) -> Result<Vec<u8>> {
        let chain = Chain::of(metadata)?;
        let mut data = encode_values(values, metadata.data_type, chain.endian)?;
        for codec in chain.compressors {
            data = compress(codec, &data)?;
        }

        Ok(data)
    }
}

impl ArrayCodec for ChainCodec {
    fn decode(&self, data: &[u8], metadata: &ArrayMetadata) -> Result<Vec<f64>> {
        let chain = Chain::of(metadata)?;
        let mut data = data.to_vec();
        for codec in chain.compressors.iter().rev() {
            data = decompress(codec, &data)?;
        }

        let expected = metadata.chunk_len() * metadata.data_type.byte_width();
        if data.len() != expected {
            return Err(Error::Decode(format!(
                "chunk has {} bytes, expecting {expected}",
                data.len()
            )));
        }

        Ok(decode_values(&data, metadata.data_type, chain.endian))
    }
}

fn compress(codec: &CodecSpec, data: &[u8]) -> Result<Vec<u8>> {
    match codec.name.as_str() {
        "gzip" => {
            let level = level(codec, 6).clamp(0, 9) as u32;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
            encoder.write_all(data)?;

            Ok(encoder.finish()?)
        }
        "zstd" => Ok(zstd::stream::encode_all(data, level(codec, 3) as i32)?),
        _ => Err(unsupported(codec)),
    }
}

fn decompress(codec: &CodecSpec, data: &[u8]) -> Result<Vec<u8>> {
    let decompressed = match codec.name.as_str() {
        "gzip" => {
            let mut decompressed = Vec::new();
            GzDecoder::new(data).read_to_end(&mut decompressed).map(|_| decompressed)
        }
        "zstd" => zstd::stream::decode_all(data),
        _ => return Err(unsupported(codec)),
    };

    decompressed.map_err(|err| Error::Decode(format!("{}: {err}", codec.name)))
}

macro_rules! numeric {
    ($($t:ident),*) => {
        paste! {
            $(
                fn [<decode_ $t>](data: &[u8], endian: Endian) -> Vec<f64> {
                    data.chunks_exact(size_of::<$t>())
                        .map(|bytes| {
                            let mut buffer = [0_u8; size_of::<$t>()];
                            buffer.copy_from_slice(bytes);
                            let value = match endian {
                                Endian::Little => $t::from_le_bytes(buffer),
                                Endian::Big => $t::from_be_bytes(buffer),
                            };

                            value as f64
                        })
                        .collect()
                }

                fn [<encode_ $t>](values: &[f64], endian: Endian) -> Result<Vec<u8>> {
                    let mut data = Vec::with_capacity(values.len() * size_of::<$t>());
                    for &value in values {
                        let value: $t = cast(value).ok_or_else(|| {
                            Error::NotSupported(format!(
                                "{value} can't be stored as {}",
                                stringify!($t)
                            ))
                        })?;
                        match endian {
                            Endian::Little => data.extend_from_slice(&value.to_le_bytes()),
                            Endian::Big => data.extend_from_slice(&value.to_be_bytes()),
                        }
                    }

                    Ok(data)
                }
            )*

            fn decode_values(data: &[u8], data_type: DataType, endian: Endian) -> Vec<f64> {
                match data_type {
                    DataType::Bool => data
                        .iter()
                        .map(|&byte| if byte == 0 { 0.0 } else { 1.0 })
                        .collect(),
                    DataType::Int8 => decode_i8(data, endian),
                    DataType::Int16 => decode_i16(data, endian),
                    DataType::Int32 => decode_i32(data, endian),
                    DataType::Int64 => decode_i64(data, endian),
                    DataType::UInt8 => decode_u8(data, endian),
                    DataType::UInt16 => decode_u16(data, endian),
                    DataType::UInt32 => decode_u32(data, endian),
                    DataType::UInt64 => decode_u64(data, endian),
                    DataType::Float32 => decode_f32(data, endian),
                    DataType::Float64 => decode_f64(data, endian),
                }
            }

            fn encode_values(values: &[f64], data_type: DataType, endian: Endian) -> Result<Vec<u8>> {
                match data_type {
                    DataType::Bool => Ok(values
                        .iter()
                        .map(|&value| u8::from(value != 0.0 && !value.is_nan()))
                        .collect()),
                    DataType::Int8 => encode_i8(values, endian),
                    DataType::Int16 => encode_i16(values, endian),
                    DataType::Int32 => encode_i32(values, endian),
                    DataType::Int64 => encode_i64(values, endian),
                    DataType::UInt8 => encode_u8(values, endian),
                    DataType::UInt16 => encode_u16(values, endian),
                    DataType::UInt32 => encode_u32(values, endian),
                    DataType::UInt64 => encode_u64(values, endian),
                    DataType::Float32 => encode_f32(values, endian),
                    DataType::Float64 => encode_f64(values, endian),
                }
            }
        }
    };
}

numeric!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn metadata(data_type: DataType, codecs: Vec<CodecSpec>) -> ArrayMetadata {
        ArrayMetadata::new(vec![2, 3], vec![2, 3], data_type).with_codecs(codecs)
    }

    #[test]
    fn test_decode_little_endian() -> Result<()> {
        let meta = metadata(DataType::Int16, vec![CodecSpec::bytes()]);
        let data: Vec<u8> = [-2_i16, -1, 0, 1, 2, 300]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        assert_eq!(
            ChainCodec.decode(&data, &meta)?,
            vec![-2.0, -1.0, 0.0, 1.0, 2.0, 300.0]
        );

        Ok(())
    }

    #[test]
    fn test_decode_big_endian() -> Result<()> {
        let meta = metadata(
            DataType::Float32,
            vec![CodecSpec::new("bytes", json!({"endian": "big"}))],
        );
        let data: Vec<u8> = [0.5_f32, 1.5, 2.5, 3.5, 4.5, f32::NAN]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();

        let values = ChainCodec.decode(&data, &meta)?;
        assert_eq!(values[..5], [0.5, 1.5, 2.5, 3.5, 4.5]);
        assert!(values[5].is_nan());

        Ok(())
    }

    #[test]
    fn test_compressed_chains() -> Result<()> {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        for codecs in [
            vec![CodecSpec::bytes(), CodecSpec::new("gzip", json!({"level": 5}))],
            vec![CodecSpec::bytes(), CodecSpec::new("zstd", json!({"level": 1}))],
            vec![
                CodecSpec::bytes(),
                CodecSpec::new("zstd", Value::Null),
                CodecSpec::new("gzip", Value::Null),
            ],
        ] {
            let meta = metadata(DataType::UInt32, codecs);
            let encoded = ChainCodec.encode(&values, &meta)?;
            assert_eq!(ChainCodec.decode(&encoded, &meta)?, values);
        }

        Ok(())
    }

    #[test]
    fn test_bool() -> Result<()> {
        let meta = metadata(DataType::Bool, vec![CodecSpec::bytes()]);
        assert_eq!(
            ChainCodec.decode(&[0, 1, 2, 0, 0, 1], &meta)?,
            vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0]
        );

        Ok(())
    }

    #[test]
    fn test_wrong_length() {
        let meta = metadata(DataType::Float64, vec![CodecSpec::bytes()]);
        assert!(matches!(
            ChainCodec.decode(&[0; 47], &meta),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_unsupported_codecs() {
        let unsupported = |codecs: Vec<CodecSpec>| {
            let meta = metadata(DataType::Float64, codecs);
            matches!(ChainCodec.decode(&[0; 48], &meta), Err(Error::NotSupported(_)))
        };
        assert!(unsupported(vec![
            CodecSpec::new("transpose", json!({"order": [1, 0]})),
            CodecSpec::bytes()
        ]));
        assert!(unsupported(vec![
            CodecSpec::bytes(),
            CodecSpec::new("blosc", Value::Null)
        ]));
        assert!(unsupported(vec![CodecSpec::new("xchacha20poly1305", Value::Null)]));
    }

    #[test]
    fn test_encode_out_of_range() {
        let meta = metadata(DataType::UInt8, vec![CodecSpec::bytes()]);
        assert!(matches!(
            ChainCodec.encode(&[1.0, 2.0, 3.0, 4.0, 5.0, 256.0], &meta),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            ChainCodec.encode(&[1.0, 2.0, 3.0, 4.0, 5.0, f64::NAN], &meta),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_is_encryption_codec() {
        assert!(is_encryption_codec("xchacha20poly1305"));
        assert!(is_encryption_codec("AES-GCM"));
        assert!(!is_encryption_codec("zstd"));
    }
}
