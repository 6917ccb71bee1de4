//! On-disk catalogue file format.
//!
//! A ctfile starts with a fixed header naming the basis of a differential
//! backup (empty for a full one), followed by tagged records: opaque
//! directory-metadata blobs produced by the data plane, and the ordered
//! 20-byte content-chunk hashes the backup references. Only the header and
//! the hash records are interpreted here; metadata blobs pass through
//! untouched.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, format_err, Error};

pub const CTFILE_MAGIC_1_0: [u8; 8] = [99, 116, 118, 49, 13, 10, 26, 10];
pub const CTFILE_VERSION: u16 = 1;

/// Record tags.
const REC_METADATA: u8 = 1;
const REC_SHA: u8 = 2;

const MAX_METADATA_RECORD: usize = 16 * 1024 * 1024;

/// Streaming reader over a catalogue file.
pub struct CtfileReader {
    file: BufReader<File>,
    previous: Option<String>,
}

impl CtfileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| format_err!("unable to open ctfile {:?} - {}", path, err))?;
        let mut file = BufReader::new(file);

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|err| format_err!("unable to read ctfile header {:?} - {}", path, err))?;
        if magic != CTFILE_MAGIC_1_0 {
            bail!("{:?} is not a ctfile", path);
        }

        let mut word = [0u8; 2];
        file.read_exact(&mut word)?;
        let version = u16::from_le_bytes(word);
        if version != CTFILE_VERSION {
            bail!("unsupported ctfile version {} in {:?}", version, path);
        }

        file.read_exact(&mut word)?;
        let prev_len = u16::from_le_bytes(word) as usize;
        let previous = if prev_len > 0 {
            let mut name = vec![0u8; prev_len];
            file.read_exact(&mut name)?;
            Some(String::from_utf8(name).map_err(|_| {
                format_err!("ctfile {:?} has a non-utf8 previous pointer", path)
            })?)
        } else {
            None
        };

        Ok(Self { file, previous })
    }

    /// The basis this differential builds on, `None` for a full backup.
    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    /// Walk the chunk hashes in order, skipping metadata records.
    pub fn for_each_sha<F>(&mut self, mut callback: F) -> Result<(), Error>
    where
        F: FnMut(&[u8; 20]) -> Result<(), Error>,
    {
        loop {
            let mut kind = [0u8; 1];
            match self.file.read(&mut kind)? {
                0 => return Ok(()),
                _ => {}
            }
            let mut len_bytes = [0u8; 4];
            self.file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;

            match kind[0] {
                REC_SHA => {
                    if len != 20 {
                        bail!("chunk hash record of length {}", len);
                    }
                    let mut sha = [0u8; 20];
                    self.file.read_exact(&mut sha)?;
                    callback(&sha)?;
                }
                REC_METADATA => {
                    if len > MAX_METADATA_RECORD {
                        bail!("metadata record of {} bytes exceeds limit", len);
                    }
                    let mut skip = vec![0u8; len];
                    self.file.read_exact(&mut skip)?;
                }
                other => bail!("unknown ctfile record tag {}", other),
            }
        }
    }
}

/// Read just the `previous` pointer of a catalogue file.
pub fn read_previous<P: AsRef<Path>>(path: P) -> Result<Option<String>, Error> {
    let reader = CtfileReader::open(path)?;
    Ok(reader.previous.clone())
}

/// Sequential catalogue file writer.
pub struct CtfileWriter {
    file: BufWriter<File>,
}

impl CtfileWriter {
    pub fn create<P: AsRef<Path>>(path: P, previous: Option<&str>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|err| format_err!("unable to create ctfile {:?} - {}", path, err))?;
        let mut file = BufWriter::new(file);

        let prev = previous.unwrap_or("");
        if prev.len() > u16::MAX as usize {
            bail!("previous pointer too long");
        }
        file.write_all(&CTFILE_MAGIC_1_0)?;
        file.write_all(&CTFILE_VERSION.to_le_bytes())?;
        file.write_all(&(prev.len() as u16).to_le_bytes())?;
        file.write_all(prev.as_bytes())?;

        Ok(Self { file })
    }

    pub fn append_metadata(&mut self, blob: &[u8]) -> Result<(), Error> {
        if blob.len() > MAX_METADATA_RECORD {
            bail!("metadata record of {} bytes exceeds limit", blob.len());
        }
        self.file.write_all(&[REC_METADATA])?;
        self.file.write_all(&(blob.len() as u32).to_le_bytes())?;
        self.file.write_all(blob)?;
        Ok(())
    }

    pub fn append_sha(&mut self, sha: &[u8; 20]) -> Result<(), Error> {
        self.file.write_all(&[REC_SHA])?;
        self.file.write_all(&20u32.to_le_bytes())?;
        self.file.write_all(sha)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), Error> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240102-030405-tag");

        let mut writer = CtfileWriter::create(&path, Some("20240101-000000-tag")).unwrap();
        writer.append_metadata(b"dir metadata blob").unwrap();
        writer.append_sha(&[0x11; 20]).unwrap();
        writer.append_sha(&[0x22; 20]).unwrap();
        writer.finish().unwrap();

        let mut reader = CtfileReader::open(&path).unwrap();
        assert_eq!(reader.previous(), Some("20240101-000000-tag"));

        let mut shas = Vec::new();
        reader
            .for_each_sha(|sha| {
                shas.push(*sha);
                Ok(())
            })
            .unwrap();
        assert_eq!(shas, vec![[0x11; 20], [0x22; 20]]);
    }

    #[test]
    fn full_backup_has_no_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240102-030405-full");

        CtfileWriter::create(&path, None).unwrap().finish().unwrap();
        assert_eq!(read_previous(&path).unwrap(), None);
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random");
        std::fs::write(&path, b"not a ctfile at all").unwrap();
        assert!(CtfileReader::open(&path).is_err());
    }
}
