//! Binary manifest codec.
//!
//! ```text
//! manifest_len   u32   bytes that follow this field
//! entry_count    u32
//! api_version    u16   big-endian, 0x1110 = 1.1.1
//! global_flags   u32
//! alias_len      u32   + alias bytes
//! metadata_len   u32   + metadata bytes
//! entry * entry_count:
//!   path_len u32 + path, uncompressed_size u32, timestamp u32,
//!   compressed_size u32, crc32 u32, flags u32, metadata_len u32 + metadata
//! ```
//!
//! Integers are little-endian except the API version.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{PharError, Result};

use super::structures::*;

impl Manifest {
    /// Serialize the manifest, including the leading `manifest_len` field.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(
            &self.entries,
            self.alias.as_deref(),
            self.metadata.as_deref(),
            self.global_flags,
        )
    }

    /// Parse a manifest starting at its `manifest_len` field.
    ///
    /// Bytes past the declared manifest length are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        decode(data)
    }

    /// Size on disk, including the `manifest_len` field.
    pub fn encoded_len(&self) -> usize {
        4 + MANIFEST_HEADER_SIZE
            + self.alias.as_ref().map_or(0, |a| a.len())
            + self.metadata.as_ref().map_or(0, |m| m.len())
            + self
                .entries
                .iter()
                .map(|e| ENTRY_FIXED_SIZE + e.path.len() + e.metadata.len())
                .sum::<usize>()
    }
}

pub fn encode(
    entries: &[PharEntry],
    alias: Option<&str>,
    metadata: Option<&[u8]>,
    global_flags: u32,
) -> Vec<u8> {
    let mut body = Vec::new();
    // Writes into a Vec cannot fail.
    let _ = write_body(&mut body, entries, alias, metadata, global_flags);

    let mut out = Vec::with_capacity(body.len() + 4);
    let _ = out.write_u32::<LittleEndian>(body.len() as u32);
    out.extend_from_slice(&body);
    out
}

fn write_body(
    out: &mut Vec<u8>,
    entries: &[PharEntry],
    alias: Option<&str>,
    metadata: Option<&[u8]>,
    global_flags: u32,
) -> std::io::Result<()> {
    out.write_u32::<LittleEndian>(entries.len() as u32)?;
    out.write_u16::<BigEndian>(API_VERSION)?;
    out.write_u32::<LittleEndian>(global_flags)?;

    let alias = alias.unwrap_or_default().as_bytes();
    out.write_u32::<LittleEndian>(alias.len() as u32)?;
    out.extend_from_slice(alias);

    let metadata = metadata.unwrap_or_default();
    out.write_u32::<LittleEndian>(metadata.len() as u32)?;
    out.extend_from_slice(metadata);

    for entry in entries {
        out.write_u32::<LittleEndian>(entry.path.len() as u32)?;
        out.extend_from_slice(entry.path.as_bytes());
        out.write_u32::<LittleEndian>(entry.uncompressed_size)?;
        out.write_u32::<LittleEndian>(entry.timestamp)?;
        out.write_u32::<LittleEndian>(entry.compressed_size)?;
        out.write_u32::<LittleEndian>(entry.crc32)?;
        out.write_u32::<LittleEndian>(entry.flags)?;
        out.write_u32::<LittleEndian>(entry.metadata.len() as u32)?;
        out.extend_from_slice(&entry.metadata);
    }
    Ok(())
}

/// Bounds-checked reads over the manifest body.
struct ManifestCursor<'a> {
    inner: Cursor<&'a [u8]>,
}

impl ManifestCursor<'_> {
    fn remaining(&self) -> usize {
        self.inner.get_ref().len() - self.inner.position() as usize
    }

    fn offset(&self) -> u64 {
        // +4 for the manifest_len field in front of the body
        self.inner.position() + 4
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        let offset = self.offset();
        self.inner
            .read_u32::<LittleEndian>()
            .map_err(|_| PharError::corrupt(offset, format!("truncated {field}")))
    }

    fn u16_be(&mut self, field: &str) -> Result<u16> {
        let offset = self.offset();
        self.inner
            .read_u16::<BigEndian>()
            .map_err(|_| PharError::corrupt(offset, format!("truncated {field}")))
    }

    fn bytes(&mut self, len: u32, field: &str) -> Result<Vec<u8>> {
        let offset = self.offset();
        if len as usize > self.remaining() {
            return Err(PharError::corrupt(
                offset,
                format!(
                    "{field} claims {len} bytes but only {} remain",
                    self.remaining()
                ),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| PharError::corrupt(offset, format!("truncated {field}")))?;
        Ok(buf)
    }

    fn sized_bytes(&mut self, field: &str) -> Result<Vec<u8>> {
        let len = self.u32(field)?;
        self.bytes(len, field)
    }
}

pub fn decode(data: &[u8]) -> Result<Manifest> {
    if data.len() < 4 {
        return Err(PharError::corrupt(0, "truncated manifest length"));
    }
    let manifest_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if manifest_len > MAX_MANIFEST_SIZE {
        return Err(PharError::corrupt(
            0,
            format!("manifest length {manifest_len} exceeds the {MAX_MANIFEST_SIZE} byte limit"),
        ));
    }
    let body_len = manifest_len as usize;
    if data.len() - 4 < body_len {
        return Err(PharError::corrupt(
            0,
            format!(
                "manifest length {manifest_len} exceeds the {} available bytes",
                data.len() - 4
            ),
        ));
    }
    if body_len < MANIFEST_HEADER_SIZE {
        return Err(PharError::corrupt(4, "manifest shorter than its header"));
    }

    let mut cursor = ManifestCursor {
        inner: Cursor::new(&data[4..4 + body_len]),
    };

    let entry_count = cursor.u32("entry count")?;
    let api_version = cursor.u16_be("API version")?;
    if api_version & API_VERSION_MASK != API_VERSION & API_VERSION_MASK {
        return Err(PharError::corrupt(
            8,
            format!("unsupported manifest API version {api_version:#06x}"),
        ));
    }
    let mut global_flags = cursor.u32("global flags")?;

    let alias = cursor.sized_bytes("alias")?;
    let alias = (!alias.is_empty()).then(|| String::from_utf8_lossy(&alias).into_owned());

    let metadata = cursor.sized_bytes("archive metadata")?;
    let metadata = (!metadata.is_empty()).then_some(metadata);

    // Refuse counts the buffer cannot possibly hold before allocating.
    let needed = u64::from(entry_count) * (ENTRY_FIXED_SIZE as u64 + 1);
    if needed > cursor.remaining() as u64 {
        return Err(PharError::corrupt(
            4,
            format!(
                "manifest claims {entry_count} entries but only {} bytes remain",
                cursor.remaining()
            ),
        ));
    }

    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let entry = read_entry(&mut cursor)?;
        global_flags |= entry.flags & flags::COMPRESSION_MASK;
        entries.push(entry);
    }

    Ok(Manifest {
        entries,
        alias,
        metadata,
        global_flags,
        api_version,
    })
}

fn read_entry(cursor: &mut ManifestCursor<'_>) -> Result<PharEntry> {
    let offset = cursor.offset();
    let path = cursor.sized_bytes("entry path")?;
    if path.is_empty() {
        return Err(PharError::corrupt(offset, "entry with empty path"));
    }
    // Lossy conversion keeps non-UTF8 names readable
    let path = String::from_utf8_lossy(&path).into_owned();

    Ok(PharEntry {
        uncompressed_size: cursor.u32("uncompressed size")?,
        timestamp: cursor.u32("timestamp")?,
        compressed_size: cursor.u32("compressed size")?,
        crc32: cursor.u32("crc32")?,
        flags: cursor.u32("entry flags")?,
        metadata: cursor.sized_bytes("entry metadata")?,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new(vec![
            PharEntry {
                path: "index.php".into(),
                uncompressed_size: 3,
                timestamp: 1_700_000_000,
                compressed_size: 3,
                crc32: crc32fast::hash(b"bar"),
                flags: flags::DEFAULT_FILE_PERMISSIONS,
                metadata: Vec::new(),
            },
            PharEntry {
                path: "src/".into(),
                uncompressed_size: 0,
                timestamp: 1_700_000_000,
                compressed_size: 0,
                crc32: 0,
                flags: flags::DEFAULT_DIR_PERMISSIONS,
                metadata: Vec::new(),
            },
            PharEntry {
                path: "src/App.php".into(),
                uncompressed_size: 120,
                timestamp: 1_700_000_001,
                compressed_size: 80,
                crc32: 0xDEAD_BEEF,
                flags: flags::DEFAULT_FILE_PERMISSIONS | flags::COMPRESSED_GZ,
                metadata: b"a:0:{}".to_vec(),
            },
        ]);
        manifest.alias = Some("app.phar".into());
        manifest.metadata = Some(b"s:3:\"foo\";".to_vec());
        manifest
    }

    #[test]
    fn round_trip() {
        let manifest = sample();
        let bytes = manifest.to_bytes();
        assert_eq!(bytes.len(), manifest.encoded_len());
        assert_eq!(Manifest::from_bytes(&bytes).unwrap(), manifest);
    }

    #[test]
    fn header_layout() {
        let bytes = Manifest::new(Vec::new()).to_bytes();
        assert_eq!(
            bytes,
            [
                18, 0, 0, 0, // manifest_len
                0, 0, 0, 0, // entry count
                0x11, 0x10, // api version
                0, 0, 0, 0, // global flags
                0, 0, 0, 0, // alias
                0, 0, 0, 0, // metadata
            ]
        );
    }

    #[test]
    fn global_flags_accumulate_entry_compression() {
        let manifest = sample();
        // Written without compression bits; decoding restores them.
        let bytes = encode(&manifest.entries, None, None, 0);
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.has_gz());
        assert!(!decoded.has_bz2());
    }

    #[test]
    fn rejects_every_truncation() {
        let bytes = sample().to_bytes();
        for len in 0..bytes.len() {
            let err = decode(&bytes[..len]).unwrap_err();
            assert!(matches!(err, PharError::CorruptManifest { .. }), "len {len}: {err}");
        }
    }

    #[test]
    fn rejects_inflated_entry_count() {
        let mut manifest = sample();
        manifest.entries.truncate(2);
        let mut bytes = manifest.to_bytes();
        bytes[4..8].copy_from_slice(&1000u32.to_le_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(
            matches!(&err, PharError::CorruptManifest { reason, .. } if reason.contains("1000 entries")),
            "{err}"
        );
    }

    #[test]
    fn rejects_oversized_path_length() {
        let mut bytes = Manifest::new(vec![sample().entries[0].clone()]).to_bytes();
        // path_len of the first entry sits right after the 22-byte header
        bytes[22..26].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            PharError::CorruptManifest { .. }
        ));
    }

    #[test]
    fn rejects_unknown_api_major() {
        let mut bytes = sample().to_bytes();
        bytes[8] = 0x20;
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            PharError::CorruptManifest { offset: 8, .. }
        ));
    }
}
