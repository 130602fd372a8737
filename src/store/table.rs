//! Standalone sorted tables for partition splits
//!
//! `extract` writes the migrating rows of a partition into a single
//! sorted table file inside a staging directory; the receiving server
//! ingests it with `ingest`. Records carry the row's sequence number so
//! the receiver can keep its own sequence counter ahead of everything it
//! swallowed.
//!
//! File layout: `magic u32 | version u32` then repeated
//! `key_len u32 | key | seq u64 | value_len u32 | value`, little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{StoreError, StoreResult};

const TABLE_MAGIC: u32 = 0x4746_5442; // "GFTB"
const TABLE_VERSION: u32 = 1;

/// Upper bound on a single record, as a corruption tripwire.
const MAX_RECORD_LEN: u32 = 16 << 20;

pub struct TableWriter {
    out: BufWriter<File>,
    records: u64,
}

impl TableWriter {
    pub fn create(path: &Path) -> StoreResult<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_u32::<LittleEndian>(TABLE_MAGIC)?;
        out.write_u32::<LittleEndian>(TABLE_VERSION)?;
        Ok(Self { out, records: 0 })
    }

    /// Append one row. Callers append in key order.
    pub fn add(&mut self, key: &[u8], seq: u64, value: &[u8]) -> StoreResult<()> {
        self.out.write_u32::<LittleEndian>(key.len() as u32)?;
        self.out.write_all(key)?;
        self.out.write_u64::<LittleEndian>(seq)?;
        self.out.write_u32::<LittleEndian>(value.len() as u32)?;
        self.out.write_all(value)?;
        self.records += 1;
        Ok(())
    }

    /// Flush everything to disk and return the record count.
    pub fn finish(mut self) -> StoreResult<u64> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.records)
    }
}

pub struct TableReader {
    input: BufReader<File>,
}

impl TableReader {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = File::open(path)?;
        let mut input = BufReader::new(file);
        let magic = input.read_u32::<LittleEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(StoreError::Corruption(format!(
                "bad table magic {magic:#x} in {}",
                path.display()
            )));
        }
        let version = input.read_u32::<LittleEndian>()?;
        if version != TABLE_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported table version {version}"
            )));
        }
        Ok(Self { input })
    }

    /// Read the next record; `None` at end of file.
    pub fn next_record(&mut self) -> StoreResult<Option<(Vec<u8>, u64, Vec<u8>)>> {
        let key_len = match self.input.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if key_len > MAX_RECORD_LEN {
            return Err(StoreError::Corruption(format!("key length {key_len}")));
        }
        let mut key = vec![0u8; key_len as usize];
        self.input.read_exact(&mut key)?;
        let seq = self.input.read_u64::<LittleEndian>()?;
        let value_len = self.input.read_u32::<LittleEndian>()?;
        if value_len > MAX_RECORD_LEN {
            return Err(StoreError::Corruption(format!("value length {value_len}")));
        }
        let mut value = vec![0u8; value_len as usize];
        self.input.read_exact(&mut value)?;
        Ok(Some((key, seq, value)))
    }
}

/// Read every record of every table file in a staging directory.
pub fn read_dir_tables(dir: &Path) -> StoreResult<Vec<(Vec<u8>, u64, Vec<u8>)>> {
    let mut rows = Vec::new();
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "tab").unwrap_or(false))
        .collect();
    paths.sort();
    for path in paths {
        let mut reader = TableReader::open(&path)?;
        while let Some(record) = reader.next_record()? {
            rows.push(record);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p1-00000000.tab");

        let mut writer = TableWriter::create(&path).unwrap();
        writer.add(b"key-a", 10, b"value-a").unwrap();
        writer.add(b"key-b", 11, b"value-b").unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let mut reader = TableReader::open(&path).unwrap();
        let (k, seq, v) = reader.next_record().unwrap().unwrap();
        assert_eq!((k.as_slice(), seq, v.as_slice()), (&b"key-a"[..], 10, &b"value-a"[..]));
        let (k, seq, _) = reader.next_record().unwrap().unwrap();
        assert_eq!((k.as_slice(), seq), (&b"key-b"[..], 11));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p0-00000000.tab");
        TableWriter::create(&path).unwrap().finish().unwrap();

        let mut reader = TableReader::open(&path).unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.tab");
        std::fs::write(&path, b"not a table file").unwrap();
        assert!(TableReader::open(&path).is_err());
    }

    #[test]
    fn test_read_dir_tables_collects_all() {
        let dir = tempfile::tempdir().unwrap();
        for (name, key) in [("p2-00000000.tab", b"k1"), ("p2-00000001.tab", b"k2")] {
            let mut w = TableWriter::create(&dir.path().join(name)).unwrap();
            w.add(key, 1, b"v").unwrap();
            w.finish().unwrap();
        }
        // Non-table files are ignored.
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let rows = read_dir_tables(dir.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"k1");
        assert_eq!(rows[1].0, b"k2");
    }
}
