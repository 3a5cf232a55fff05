use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{Error, Result};

/// Free form attributes attached to arrays, coordinates and datasets
///
pub type Attributes = Map<String, Value>;

/// Declared element type of an array
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Number of bytes taken by one element
    pub fn byte_width(&self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Fill value used when none is given: NaN for floats, zero for everything else
    pub fn default_fill(&self) -> f64 {
        if self.is_float() {
            f64::NAN
        } else {
            0.0
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let data_type = match s {
            "bool" => DataType::Bool,
            "int8" => DataType::Int8,
            "int16" => DataType::Int16,
            "int32" => DataType::Int32,
            "int64" => DataType::Int64,
            "uint8" => DataType::UInt8,
            "uint16" => DataType::UInt16,
            "uint32" => DataType::UInt32,
            "uint64" => DataType::UInt64,
            "float32" => DataType::Float32,
            "float64" => DataType::Float64,
            _ => return Err(Error::NotSupported(format!("data type {s}"))),
        };

        Ok(data_type)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of an array's codec chain
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub configuration: Value,
}

impl CodecSpec {
    pub fn new<S: Into<String>>(name: S, configuration: Value) -> Self {
        Self {
            name: name.into(),
            configuration,
        }
    }

    /// The `bytes` codec with little endian byte order
    pub fn bytes() -> Self {
        Self::new("bytes", json!({"endian": "little"}))
    }
}

/// Everything known about an array from its metadata document
///
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayMetadata {
    pub shape: Vec<usize>,
    pub chunk_shape: Vec<usize>,
    pub dimension_names: Vec<String>,
    pub data_type: DataType,
    pub fill_value: f64,
    pub attributes: Attributes,
    pub codecs: Vec<CodecSpec>,
}

impl ArrayMetadata {
    pub fn new(shape: Vec<usize>, chunk_shape: Vec<usize>, data_type: DataType) -> Self {
        let dimension_names = synthesized_names(shape.len());
        Self {
            shape,
            chunk_shape,
            dimension_names,
            data_type,
            fill_value: data_type.default_fill(),
            attributes: Attributes::new(),
            codecs: vec![CodecSpec::bytes()],
        }
    }

    pub fn with_dimension_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.dimension_names = names.iter().map(|name| name.as_ref().to_string()).collect();
        self
    }

    pub fn with_fill_value(mut self, fill_value: f64) -> Self {
        self.fill_value = fill_value;
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_codecs(mut self, codecs: Vec<CodecSpec>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements in one chunk
    pub fn chunk_len(&self) -> usize {
        self.chunk_shape.iter().product()
    }

    /// Render as a zarr v3 array metadata document
    ///
    pub fn to_json(&self) -> Value {
        json!({
            "zarr_format": 3,
            "node_type": "array",
            "shape": self.shape,
            "data_type": self.data_type.name(),
            "chunk_grid": {
                "name": "regular",
                "configuration": {"chunk_shape": self.chunk_shape},
            },
            "chunk_key_encoding": {"name": "default", "configuration": {"separator": "/"}},
            "fill_value": fill_value_json(self.fill_value),
            "codecs": self.codecs,
            "attributes": self.attributes,
            "dimension_names": self.dimension_names,
        })
    }
}

/// A parsed metadata document
///
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Array(ArrayMetadata),
    Group(Attributes),
}

#[derive(Deserialize)]
struct NodeDocument {
    node_type: String,
    shape: Option<Vec<usize>>,
    dimension_names: Option<Vec<Option<String>>>,
    chunk_grid: Option<ChunkGridDocument>,
    data_type: Option<String>,
    #[serde(default)]
    fill_value: Value,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    codecs: Vec<CodecSpec>,
}

#[derive(Deserialize)]
struct ChunkGridDocument {
    configuration: ChunkGridConfiguration,
}

#[derive(Deserialize)]
struct ChunkGridConfiguration {
    chunk_shape: Vec<usize>,
}

impl Node {
    /// Parse a `zarr.json` document
    ///
    pub fn parse(data: &[u8]) -> Result<Self> {
        let document: NodeDocument = serde_json::from_slice(data)
            .map_err(|err| Error::InvalidMetadata(format!("unparsable document: {err}")))?;

        match document.node_type.as_str() {
            "group" => Ok(Node::Group(document.attributes)),
            "array" => parse_array(document).map(Node::Array),
            other => Err(Error::InvalidMetadata(format!("unknown node type {other:?}"))),
        }
    }
}

fn parse_array(document: NodeDocument) -> Result<ArrayMetadata> {
    let missing = |field: &str| Error::InvalidMetadata(format!("array is missing {field}"));

    let shape = document.shape.ok_or_else(|| missing("shape"))?;
    let chunk_shape = document
        .chunk_grid
        .ok_or_else(|| missing("chunk_grid"))?
        .configuration
        .chunk_shape;
    if chunk_shape.len() != shape.len() || chunk_shape.iter().any(|&extent| extent == 0) {
        return Err(Error::InvalidMetadata(format!(
            "chunk shape {chunk_shape:?} doesn't fit shape {shape:?}"
        )));
    }

    let data_type = document
        .data_type
        .ok_or_else(|| missing("data_type"))?
        .parse()?;

    let dimension_names = match document.dimension_names {
        None => synthesized_names(shape.len()),
        Some(names) => {
            if names.len() != shape.len() {
                return Err(Error::InvalidMetadata(format!(
                    "{} dimension names for an array of rank {}",
                    names.len(),
                    shape.len()
                )));
            }
            names
                .into_iter()
                .enumerate()
                .map(|(i, name)| name.unwrap_or_else(|| synthesized_name(i)))
                .collect()
        }
    };

    Ok(ArrayMetadata {
        shape,
        chunk_shape,
        dimension_names,
        data_type,
        fill_value: parse_fill_value(&document.fill_value, data_type)?,
        attributes: document.attributes,
        codecs: document.codecs,
    })
}

fn synthesized_name(i: usize) -> String {
    format!("dim_{i}")
}

fn synthesized_names(rank: usize) -> Vec<String> {
    (0..rank).map(synthesized_name).collect()
}

fn parse_fill_value(value: &Value, data_type: DataType) -> Result<f64> {
    match value {
        Value::Null => Ok(data_type.default_fill()),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::InvalidMetadata(format!("bad fill value {n}"))),
        Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            _ => Err(Error::InvalidMetadata(format!("bad fill value {s:?}"))),
        },
        other => Err(Error::InvalidMetadata(format!("bad fill value {other}"))),
    }
}

fn fill_value_json(fill_value: f64) -> Value {
    if fill_value.is_nan() {
        json!("NaN")
    } else if fill_value == f64::INFINITY {
        json!("Infinity")
    } else if fill_value == f64::NEG_INFINITY {
        json!("-Infinity")
    } else {
        json!(fill_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_array() -> Result<()> {
        let document = br#"{
            "zarr_format": 3,
            "node_type": "array",
            "shape": [10, 20],
            "data_type": "float32",
            "chunk_grid": {"name": "regular", "configuration": {"chunk_shape": [5, 5]}},
            "fill_value": "NaN",
            "codecs": [{"name": "bytes", "configuration": {"endian": "little"}},
                       {"name": "zstd", "configuration": {"level": 3}}],
            "attributes": {"units": "mm"},
            "dimension_names": ["time", null]
        }"#;

        let Node::Array(metadata) = Node::parse(document)? else {
            panic!("expecting an array");
        };
        assert_eq!(metadata.shape, vec![10, 20]);
        assert_eq!(metadata.chunk_shape, vec![5, 5]);
        assert_eq!(metadata.dimension_names, vec!["time", "dim_1"]);
        assert_eq!(metadata.data_type, DataType::Float32);
        assert!(metadata.fill_value.is_nan());
        assert_eq!(metadata.attributes["units"], "mm");
        assert_eq!(metadata.codecs.len(), 2);
        assert_eq!(metadata.codecs[1].name, "zstd");
        assert_eq!(metadata.chunk_len(), 25);

        Ok(())
    }

    #[test]
    fn test_parse_group() -> Result<()> {
        let document = br#"{"zarr_format": 3, "node_type": "group", "attributes": {"a": 1}}"#;
        assert!(matches!(Node::parse(document)?, Node::Group(attrs) if attrs["a"] == 1));

        Ok(())
    }

    #[test]
    fn test_parse_invalid() {
        let invalid = |document: &[u8]| matches!(Node::parse(document), Err(Error::InvalidMetadata(_)));
        assert!(invalid(b"not json"));
        assert!(invalid(br#"{"node_type": "tree"}"#));
        assert!(invalid(br#"{"node_type": "array", "data_type": "int8"}"#));
        assert!(invalid(
            br#"{"node_type": "array", "shape": [4], "data_type": "int8",
                 "chunk_grid": {"configuration": {"chunk_shape": [2, 2]}}}"#
        ));
        assert!(invalid(
            br#"{"node_type": "array", "shape": [4], "data_type": "int8", "fill_value": "x",
                 "chunk_grid": {"configuration": {"chunk_shape": [2]}}}"#
        ));
        assert!(matches!(
            Node::parse(
                br#"{"node_type": "array", "shape": [4], "data_type": "complex64",
                     "chunk_grid": {"configuration": {"chunk_shape": [2]}}}"#
            ),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_to_json_parses_back() -> Result<()> {
        let mut attributes = Attributes::new();
        attributes.insert("units".into(), json!("K"));
        let metadata = ArrayMetadata::new(vec![4, 6], vec![2, 3], DataType::Int16)
            .with_dimension_names(&["lat", "lon"])
            .with_fill_value(-9999.0)
            .with_attributes(attributes);

        let document = serde_json::to_vec(&metadata.to_json())?;
        assert_eq!(Node::parse(&document)?, Node::Array(metadata));

        Ok(())
    }

    #[test]
    fn test_integer_fill_defaults_to_zero() -> Result<()> {
        assert_eq!(ArrayMetadata::new(vec![5], vec![2], DataType::Int32).fill_value, 0.0);
        assert!(ArrayMetadata::new(vec![5], vec![2], DataType::Float32).fill_value.is_nan());

        let document = |data_type: &str| {
            format!(
                r#"{{"zarr_format": 3, "node_type": "array", "shape": [4], "data_type": "{data_type}",
                    "chunk_grid": {{"name": "regular", "configuration": {{"chunk_shape": [2]}}}},
                    "fill_value": null, "codecs": [{{"name": "bytes"}}]}}"#
            )
        };
        let Node::Array(uint) = Node::parse(document("uint8").as_bytes())? else {
            panic!("expecting an array");
        };
        assert_eq!(uint.fill_value, 0.0);
        let Node::Array(float) = Node::parse(document("float64").as_bytes())? else {
            panic!("expecting an array");
        };
        assert!(float.fill_value.is_nan());

        Ok(())
    }

    #[test]
    fn test_byte_width() -> Result<()> {
        assert_eq!("float64".parse::<DataType>()?.byte_width(), 8);
        assert_eq!("uint16".parse::<DataType>()?.byte_width(), 2);
        assert_eq!(DataType::Bool.byte_width(), 1);

        Ok(())
    }
}
