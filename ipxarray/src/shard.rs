use std::{io::Cursor, ops::Deref};

use bytes::Bytes;
use cid::Cid;

use crate::{
    cache::Cacheable,
    errors::{Error, Result},
    extio::{ExtendedRead, ExtendedWrite},
};

const MAGIC_NUMBER: u16 = 0x5A53;
const FORMAT_VERSION: u32 = 1;
const NODE_SHARD: u8 = 1;

/// Bytes taken by a CIDv1 with a 32 byte digest, close enough for cache accounting
const CID_SIZE: u64 = 36;

/// A decoded shard of a chunk index.
///
/// Entry `i` holds the CID of the chunk at flat index `shard_index * chunks_per_shard + i`, or
/// `None` if that chunk was never written.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Shard(Vec<Option<Cid>>);

impl Shard {
    pub fn new(entries: Vec<Option<Cid>>) -> Self {
        Self(entries)
    }

    /// Shard with every entry absent
    pub fn empty(len: usize) -> Self {
        Self(vec![None; len])
    }

    /// The CID at `offset`, if present
    pub fn entry(&self, offset: usize) -> Option<&Cid> {
        self.0.get(offset).and_then(|entry| entry.as_ref())
    }

    /// Serialize to the binary node format.
    ///
    /// The layout is a small header (magic number, format version, node type), the number of
    /// entries as a varint, then for each entry a presence byte followed, when present, by the
    /// CID's binary form.
    ///
    pub fn encode(&self) -> Result<Bytes> {
        let mut stream = Vec::with_capacity(16 + self.0.len() * CID_SIZE as usize);
        stream.write_u16(MAGIC_NUMBER)?;
        stream.write_u32(FORMAT_VERSION)?;
        stream.write_byte(NODE_SHARD)?;
        stream.write_varint(self.0.len() as u64)?;
        for entry in &self.0 {
            match entry {
                None => stream.write_byte(0)?,
                Some(cid) => {
                    stream.write_byte(1)?;
                    stream.write_cid(cid)?;
                }
            }
        }

        Ok(stream.into())
    }

    /// Decode a shard, checking it has `expected` entries.
    ///
    pub fn decode(data: &[u8], expected: usize) -> Result<Self> {
        let mut stream = Cursor::new(data);
        let bad = |what: &str| Error::Decode(format!("shard: {what}"));

        if stream.read_u16().map_err(|_| bad("truncated header"))? != MAGIC_NUMBER {
            return Err(bad("not a shard node"));
        }
        let version = stream.read_u32().map_err(|_| bad("truncated header"))?;
        if version != FORMAT_VERSION {
            return Err(bad(&format!("unrecognized format version {version}")));
        }
        let node_type = stream.read_byte().map_err(|_| bad("truncated header"))?;
        if node_type != NODE_SHARD {
            return Err(bad(&format!("unexpected node type {node_type}")));
        }

        let n = stream.read_varint()? as usize;
        if n != expected {
            return Err(bad(&format!("expected {expected} entries, found {n}")));
        }

        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let entry = match stream.read_byte().map_err(|_| bad("truncated entries"))? {
                0 => None,
                1 => Some(stream.read_cid()?),
                flag => return Err(bad(&format!("bad entry flag {flag}"))),
            };
            entries.push(entry);
        }

        if (stream.position() as usize) < data.len() {
            return Err(bad("trailing bytes"));
        }

        Ok(Self(entries))
    }
}

impl Deref for Shard {
    type Target = [Option<Cid>];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Cacheable for Shard {
    fn size(&self) -> u64 {
        1 + self.0.len() as u64 * CID_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing;

    #[test]
    fn test_encode_decode() -> Result<()> {
        let shard = Shard::new(vec![
            Some(testing::cid_for("zero")),
            None,
            Some(testing::cid_for("two")),
            None,
        ]);
        let encoded = shard.encode()?;
        let decoded = Shard::decode(&encoded, 4)?;

        assert_eq!(decoded, shard);
        assert_eq!(decoded.entry(0), Some(&testing::cid_for("zero")));
        assert_eq!(decoded.entry(1), None);
        assert_eq!(decoded.entry(9), None);

        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() -> Result<()> {
        assert!(matches!(Shard::decode(b"nope", 1), Err(Error::Decode(_))));

        let encoded = Shard::empty(3).encode()?;
        assert!(matches!(Shard::decode(&encoded, 4), Err(Error::Decode(_))));

        let mut trailing = encoded.to_vec();
        trailing.push(0);
        assert!(matches!(Shard::decode(&trailing, 3), Err(Error::Decode(_))));

        let mut truncated = Shard::new(vec![Some(testing::cid_for("x"))]).encode()?.to_vec();
        truncated.truncate(truncated.len() - 4);
        assert!(Shard::decode(&truncated, 1).is_err());

        Ok(())
    }
}
