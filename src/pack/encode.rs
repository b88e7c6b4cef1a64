//! Pack writing
//!
//! Produces version 2 packs with whole objects and either kind of delta.
//! Used to build packs from stored objects and in tests.

use std::io::{self, Write};

use flate2::{write::ZlibEncoder, Compression};
use gix_object::Kind;
use sha1::{Digest, Sha1};

use super::{delta, objects::GitObject, ObjectId};

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

fn type_code(kind: Kind) -> u8 {
    match kind {
        Kind::Commit => 1,
        Kind::Tree => 2,
        Kind::Blob => 3,
        Kind::Tag => 4,
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams a pack into `W`.
///
/// The object count is written up front and is not checked against the
/// number of entries added.
pub struct PackEncoder<W: Write> {
    out: HashingWriter<W>,
    offset: u64,
}

impl<W: Write> PackEncoder<W> {
    pub fn new(out: W, count: u32) -> io::Result<Self> {
        let mut encoder = Self {
            out: HashingWriter {
                inner: out,
                hasher: Sha1::new(),
            },
            offset: 0,
        };
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(b"PACK");
        header.extend_from_slice(&2u32.to_be_bytes());
        header.extend_from_slice(&count.to_be_bytes());
        encoder.write(&header)?;
        Ok(encoder)
    }

    /// Current write position, i.e. the offset the next entry will get
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn write_entry(
        &mut self,
        code: u8,
        size: usize,
        prefix: &[u8],
        data: &[u8],
    ) -> io::Result<u64> {
        let start = self.offset;

        let mut header = Vec::with_capacity(10 + prefix.len());
        let mut byte = (code << 4) | (size & 0x0f) as u8;
        let mut rest = size >> 4;
        while rest != 0 {
            header.push(byte | 0x80);
            byte = (rest & 0x7f) as u8;
            rest >>= 7;
        }
        header.push(byte);
        header.extend_from_slice(prefix);

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(data)?;
        let compressed = zlib.finish()?;

        self.write(&header)?;
        self.write(&compressed)?;
        Ok(start)
    }

    /// Append a whole object; returns its offset.
    pub fn add_object(&mut self, kind: Kind, data: &[u8]) -> io::Result<u64> {
        self.write_entry(type_code(kind), data.len(), &[], data)
    }

    /// Append a delta against the entry at `base_offset`; returns its offset.
    pub fn add_ofs_delta(&mut self, base_offset: u64, delta: &[u8]) -> io::Result<u64> {
        let distance = self.offset.checked_sub(base_offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "ofs-delta base must precede the delta")
        })?;

        let mut encoded = vec![(distance & 0x7f) as u8];
        let mut rest = distance >> 7;
        while rest != 0 {
            rest -= 1;
            encoded.push(0x80 | (rest & 0x7f) as u8);
            rest >>= 7;
        }
        encoded.reverse();

        self.write_entry(OBJ_OFS_DELTA, delta.len(), &encoded, delta)
    }

    /// Append a delta against the object `base`; returns its offset.
    pub fn add_ref_delta(&mut self, base: &ObjectId, delta: &[u8]) -> io::Result<u64> {
        self.write_entry(OBJ_REF_DELTA, delta.len(), base.as_bytes(), delta)
    }

    /// Write the trailing checksum and hand back the writer.
    pub fn finish(mut self) -> io::Result<(W, ObjectId)> {
        let checksum = ObjectId::from_bytes(self.out.hasher.finalize_reset().into());
        self.out.inner.write_all(checksum.as_bytes())?;
        self.out.inner.flush()?;
        Ok((self.out.inner, checksum))
    }
}

/// Build an in-memory pack from `objects`.
///
/// Each object after the first of the same kind is stored as an ofs-delta
/// against its predecessor when that makes the entry smaller.
pub fn encode_objects(objects: &[GitObject]) -> io::Result<(Vec<u8>, ObjectId)> {
    let mut encoder = PackEncoder::new(Vec::new(), objects.len() as u32)?;
    let mut previous: Option<(u64, &GitObject)> = None;

    for object in objects {
        let offset = match previous {
            Some((base_offset, base)) if base.kind == object.kind => {
                let d = delta::encode(&base.data, &object.data);
                if d.len() < object.data.len() {
                    encoder.add_ofs_delta(base_offset, &d)?
                } else {
                    encoder.add_object(object.kind, &object.data)?
                }
            }
            _ => encoder.add_object(object.kind, &object.data)?,
        };
        previous = Some((offset, object));
    }
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::pack::decode::{CollectObjects, PackfileDecoder, Seekable};

    #[test]
    fn test_header_and_trailer_layout() {
        let (pack, checksum) = PackEncoder::new(Vec::new(), 0).unwrap().finish().unwrap();
        assert_eq!(&pack[..4], b"PACK");
        assert_eq!(&pack[4..12], &[0, 0, 0, 2, 0, 0, 0, 0]);
        let digest: [u8; 20] = Sha1::digest(&pack[..12]).into();
        assert_eq!(checksum, ObjectId::from_bytes(digest));
        assert_eq!(&pack[12..], checksum.as_bytes());
    }

    #[test]
    fn test_large_size_varint() {
        let data = vec![b'a'; 100_000];
        let mut encoder = PackEncoder::new(Vec::new(), 1).unwrap();
        encoder.add_object(Kind::Blob, &data).unwrap();
        let (pack, _) = encoder.finish().unwrap();
        // blob type, continuation bit set, low nibble of 100_000 (0x186a0)
        assert_eq!(pack[12], 0x80 | (3 << 4));
    }

    #[test]
    fn test_encode_objects_decodes_back() {
        let mut body = b"fn main() {}\n".repeat(20);
        let mut objects = vec![GitObject::from_raw(Kind::Blob, body.clone())];
        body.extend_from_slice(b"// more\n");
        objects.push(GitObject::from_raw(Kind::Blob, body));
        objects.push(GitObject::from_raw(Kind::Tree, Vec::new()));

        let (pack, checksum) = encode_objects(&objects).unwrap();
        let mut collected = CollectObjects::default();
        let decoded = PackfileDecoder::new(Seekable(Cursor::new(&pack)))
            .observer(&mut collected)
            .decode()
            .unwrap();

        assert_eq!(decoded, checksum);
        let ids: Vec<ObjectId> = collected.objects.iter().map(|o| o.id).collect();
        assert!(objects.iter().all(|o| ids.contains(&o.id)));
    }

    #[test]
    fn test_ofs_delta_base_must_precede() {
        let mut encoder = PackEncoder::new(Vec::new(), 1).unwrap();
        let err = encoder.add_ofs_delta(1_000, b"").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
