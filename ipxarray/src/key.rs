//! Key conventions for metadata documents and chunks.
//!
//! Chunk keys follow the zarr v3 default encoding, `<array path>/c/<i>/<j>/...`, or `c/<i>/...`
//! for an array at the root. The older dot-separated form, `<array path>/<i>.<j>`, is also
//! understood.
//!

const METADATA_DOCUMENTS: [&str; 5] = ["zarr.json", ".zarray", ".zattrs", ".zgroup", ".zmetadata"];

/// A parsed chunk key
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkKey {
    /// Path of the array, without leading or trailing slashes. Empty for a root array.
    pub array: String,

    /// Position of the chunk in the chunk grid
    pub coords: Vec<usize>,
}

impl ChunkKey {
    pub fn new<S: Into<String>>(array: S, coords: Vec<usize>) -> Self {
        Self {
            array: array.into(),
            coords,
        }
    }

    /// Parse a chunk key. Returns `None` for anything that isn't one.
    ///
    pub fn parse(key: &str) -> Option<Self> {
        let key = key.trim_matches('/');
        if is_metadata_key(key) {
            return None;
        }

        let (array, rest) = if key == "c" {
            ("", "")
        } else if let Some(rest) = key.strip_prefix("c/") {
            ("", rest)
        } else if let Some(at) = key.rfind("/c/") {
            (&key[..at], &key[at + 3..])
        } else if let Some(array) = key.strip_suffix("/c") {
            (array, "")
        } else {
            // Dot separated, last path segment only
            let (array, last) = match key.rfind('/') {
                Some(at) => (&key[..at], &key[at + 1..]),
                None => ("", key),
            };
            let coords = parse_coords(last, '.')?;
            return Some(Self::new(array, coords));
        };

        let coords = if rest.is_empty() {
            vec![]
        } else {
            parse_coords(rest, '/')?
        };

        Some(Self::new(array, coords))
    }

    /// Format this key using the default encoding
    ///
    pub fn encode(&self) -> String {
        let mut key = if self.array.is_empty() {
            String::from("c")
        } else {
            format!("{}/c", self.array)
        };
        for coord in &self.coords {
            key.push('/');
            key.push_str(&coord.to_string());
        }

        key
    }
}

fn parse_coords(s: &str, separator: char) -> Option<Vec<usize>> {
    s.split(separator)
        .map(|part| part.parse::<usize>().ok())
        .collect()
}

/// Whether a key names a metadata document
///
pub fn is_metadata_key(key: &str) -> bool {
    let last = key.rsplit('/').next().unwrap_or(key);
    METADATA_DOCUMENTS.contains(&last)
}

/// Key of the `zarr.json` document for the node at `path`
///
pub fn metadata_key(path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        String::from("zarr.json")
    } else {
        format!("{path}/zarr.json")
    }
}

/// Join a group prefix and a node name into a node path
///
pub fn join(group: &str, name: &str) -> String {
    let group = group.trim_matches('/');
    if group.is_empty() {
        name.to_string()
    } else {
        format!("{group}/{name}")
    }
}
