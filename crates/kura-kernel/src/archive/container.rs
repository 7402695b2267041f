//! Forward-only ZIP container writer.
//!
//! Entries arrive fully prepared (CRC, sizes and payload known), so each
//! local header is written with its final values and the sink never needs to
//! seek. No data descriptors are used. Zip64 records are emitted only when a
//! size, offset or entry count exceeds the classic format's limits.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Timelike, Utc};
use flate2::write::DeflateEncoder;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use super::job::Compression;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;
const ZIP64_END_OF_CENTRAL_DIR_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const EXTENDED_TIMESTAMP_ID: u16 = 0x5455;

/// Values at or above this need a Zip64 field.
const ZIP64_LIMIT: u64 = u32::MAX as u64;
const ZIP64_COUNT_LIMIT: usize = u16::MAX as usize;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
/// Upper byte 3 = unix, so external attributes carry a mode.
const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;

/// General purpose flag bit 11: names are UTF-8.
const FLAG_UTF8: u16 = 1 << 11;

const FILE_MODE: u32 = 0o100644;
const DIR_MODE: u32 = 0o040755;
const MSDOS_DIR_ATTR: u32 = 0x10;

const BUFFER_SIZE: usize = 64 * 1024;

/// ZIP compression method of a stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflated,
}

impl Method {
    fn code(self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
        }
    }
}

/// A ready-to-write archive entry.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    /// `/`-separated archive path; directories end with `/`.
    pub name: String,
    pub is_dir: bool,
    pub modified: SystemTime,
    pub method: Method,
    pub crc32: u32,
    pub uncompressed_size: u64,
    /// Payload as stored in the archive (compressed for `Deflated`).
    pub data: Vec<u8>,
}

impl ZipEntry {
    /// A directory entry. A trailing `/` is added if missing.
    pub fn directory(name: impl Into<String>, modified: SystemTime) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            name,
            is_dir: true,
            modified,
            method: Method::Stored,
            crc32: 0,
            uncompressed_size: 0,
            data: Vec::new(),
        }
    }

    /// A file entry, encoding `contents` with `compression`.
    ///
    /// CPU-bound; callers on the async runtime run it on the blocking pool.
    pub fn file(
        name: impl Into<String>,
        modified: SystemTime,
        contents: Vec<u8>,
        compression: Compression,
    ) -> io::Result<Self> {
        let crc32 = crc32fast::hash(&contents);
        let uncompressed_size = contents.len() as u64;

        let (method, data) = match compression {
            Compression::Stored => (Method::Stored, contents),
            Compression::Deflate => {
                let deflated = deflate(&contents)?;
                if deflated.len() < contents.len() {
                    (Method::Deflated, deflated)
                } else {
                    (Method::Stored, contents)
                }
            }
        };

        Ok(Self {
            name: name.into(),
            is_dir: false,
            modified,
            method,
            crc32,
            uncompressed_size,
            data,
        })
    }

    fn compressed_size(&self) -> u64 {
        self.data.len() as u64
    }
}

fn deflate(contents: &[u8]) -> io::Result<Vec<u8>> {
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(contents.len() / 2),
        flate2::Compression::default(),
    );
    encoder.write_all(contents)?;
    encoder.finish()
}

/// What the central directory needs to remember about a written entry.
#[derive(Debug)]
struct CentralRecord {
    name: String,
    is_dir: bool,
    method: Method,
    dos_time: u16,
    dos_date: u16,
    unix_mtime: u32,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    offset: u64,
}

/// Streams a ZIP archive into any `AsyncWrite`.
pub struct ZipWriter<W: AsyncWrite + Unpin> {
    sink: BufWriter<W>,
    offset: u64,
    central: Vec<CentralRecord>,
}

impl<W: AsyncWrite + Unpin> ZipWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: BufWriter::with_capacity(BUFFER_SIZE, sink),
            offset: 0,
            central: Vec::new(),
        }
    }

    /// Names of the entries written so far, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.central.iter().map(|r| r.name.as_str())
    }

    /// Write one entry: local header followed by its payload.
    pub async fn write_entry(&mut self, entry: &ZipEntry) -> io::Result<()> {
        let (dos_time, dos_date) = dos_datetime(entry.modified);
        let unix_mtime = unix_seconds(entry.modified);
        let compressed_size = entry.compressed_size();
        let zip64 = entry.uncompressed_size >= ZIP64_LIMIT || compressed_size >= ZIP64_LIMIT;

        let mut extra = Vec::new();
        if zip64 {
            put_u16(&mut extra, ZIP64_EXTRA_ID);
            put_u16(&mut extra, 16);
            put_u64(&mut extra, entry.uncompressed_size);
            put_u64(&mut extra, compressed_size);
        }
        put_timestamp(&mut extra, unix_mtime);

        let mut header = Vec::with_capacity(30 + entry.name.len() + extra.len());
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
        put_u16(&mut header, FLAG_UTF8);
        put_u16(&mut header, entry.method.code());
        put_u16(&mut header, dos_time);
        put_u16(&mut header, dos_date);
        put_u32(&mut header, entry.crc32);
        put_u32(&mut header, if zip64 { u32::MAX } else { compressed_size as u32 });
        put_u32(&mut header, if zip64 { u32::MAX } else { entry.uncompressed_size as u32 });
        put_u16(&mut header, entry.name.len() as u16);
        put_u16(&mut header, extra.len() as u16);
        header.extend_from_slice(entry.name.as_bytes());
        header.extend_from_slice(&extra);

        let offset = self.offset;
        self.sink.write_all(&header).await?;
        self.sink.write_all(&entry.data).await?;
        self.offset += header.len() as u64 + compressed_size;

        self.central.push(CentralRecord {
            name: entry.name.clone(),
            is_dir: entry.is_dir,
            method: entry.method,
            dos_time,
            dos_date,
            unix_mtime,
            crc32: entry.crc32,
            compressed_size,
            uncompressed_size: entry.uncompressed_size,
            offset,
        });
        Ok(())
    }

    /// Write the central directory and end records, flush, and hand back
    /// the sink with the total byte count.
    pub async fn finish(mut self) -> io::Result<(W, u64)> {
        let cd_offset = self.offset;
        for record in &self.central {
            let header = central_header(record);
            self.sink.write_all(&header).await?;
            self.offset += header.len() as u64;
        }
        let cd_size = self.offset - cd_offset;
        let count = self.central.len();

        let mut tail = Vec::new();
        if count >= ZIP64_COUNT_LIMIT || cd_size >= ZIP64_LIMIT || cd_offset >= ZIP64_LIMIT {
            let zip64_end_offset = self.offset;

            put_u32(&mut tail, ZIP64_END_OF_CENTRAL_DIR_SIG);
            put_u64(&mut tail, 44);
            put_u16(&mut tail, VERSION_MADE_BY);
            put_u16(&mut tail, VERSION_ZIP64);
            put_u32(&mut tail, 0);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, count as u64);
            put_u64(&mut tail, count as u64);
            put_u64(&mut tail, cd_size);
            put_u64(&mut tail, cd_offset);

            put_u32(&mut tail, ZIP64_LOCATOR_SIG);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, zip64_end_offset);
            put_u32(&mut tail, 1);
        }

        let count16 = count.min(ZIP64_COUNT_LIMIT) as u16;
        put_u32(&mut tail, END_OF_CENTRAL_DIR_SIG);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, count16);
        put_u16(&mut tail, count16);
        put_u32(&mut tail, cd_size.min(ZIP64_LIMIT) as u32);
        put_u32(&mut tail, cd_offset.min(ZIP64_LIMIT) as u32);
        put_u16(&mut tail, 0);

        self.sink.write_all(&tail).await?;
        self.offset += tail.len() as u64;
        self.sink.flush().await?;

        Ok((self.sink.into_inner(), self.offset))
    }
}

fn central_header(record: &CentralRecord) -> Vec<u8> {
    let big_uncompressed = record.uncompressed_size >= ZIP64_LIMIT;
    let big_compressed = record.compressed_size >= ZIP64_LIMIT;
    let big_offset = record.offset >= ZIP64_LIMIT;
    let zip64 = big_uncompressed || big_compressed || big_offset;

    let mut extra = Vec::new();
    if zip64 {
        let mut fields = Vec::new();
        if big_uncompressed {
            put_u64(&mut fields, record.uncompressed_size);
        }
        if big_compressed {
            put_u64(&mut fields, record.compressed_size);
        }
        if big_offset {
            put_u64(&mut fields, record.offset);
        }
        put_u16(&mut extra, ZIP64_EXTRA_ID);
        put_u16(&mut extra, fields.len() as u16);
        extra.extend_from_slice(&fields);
    }
    put_timestamp(&mut extra, record.unix_mtime);

    let external_attrs = if record.is_dir {
        (DIR_MODE << 16) | MSDOS_DIR_ATTR
    } else {
        FILE_MODE << 16
    };
    let clamp = |v: u64, big: bool| if big { u32::MAX } else { v as u32 };

    let mut header = Vec::with_capacity(46 + record.name.len() + extra.len());
    put_u32(&mut header, CENTRAL_HEADER_SIG);
    put_u16(&mut header, VERSION_MADE_BY);
    put_u16(&mut header, if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
    put_u16(&mut header, FLAG_UTF8);
    put_u16(&mut header, record.method.code());
    put_u16(&mut header, record.dos_time);
    put_u16(&mut header, record.dos_date);
    put_u32(&mut header, record.crc32);
    put_u32(&mut header, clamp(record.compressed_size, big_compressed));
    put_u32(&mut header, clamp(record.uncompressed_size, big_uncompressed));
    put_u16(&mut header, record.name.len() as u16);
    put_u16(&mut header, extra.len() as u16);
    put_u16(&mut header, 0); // comment length
    put_u16(&mut header, 0); // disk number start
    put_u16(&mut header, 0); // internal attributes
    put_u32(&mut header, external_attrs);
    put_u32(&mut header, clamp(record.offset, big_offset));
    header.extend_from_slice(record.name.as_bytes());
    header.extend_from_slice(&extra);
    header
}

/// Extended timestamp extra field carrying the modification time.
fn put_timestamp(buf: &mut Vec<u8>, unix_mtime: u32) {
    put_u16(buf, EXTENDED_TIMESTAMP_ID);
    put_u16(buf, 5);
    buf.push(0x01);
    put_u32(buf, unix_mtime);
}

/// MS-DOS (time, date) in UTC, clamped to the representable 1980–2107 range.
pub(crate) fn dos_datetime(t: SystemTime) -> (u16, u16) {
    let dt: DateTime<Utc> = t.into();
    let year = dt.year();
    if year < 1980 {
        return (0, (1 << 5) | 1);
    }
    if year > 2107 {
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }
    let time = (dt.hour() << 11) | (dt.minute() << 5) | (dt.second() / 2);
    let date = (((year - 1980) as u32) << 9) | (dt.month() << 5) | dt.day();
    (time as u16, date as u16)
}

fn unix_seconds(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(i32::MAX as u64) as u32)
        .unwrap_or(0)
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    async fn write_all(entries: &[ZipEntry]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Vec::new());
        for entry in entries {
            writer.write_entry(entry).await.unwrap();
        }
        let (bytes, total) = writer.finish().await.unwrap();
        assert_eq!(bytes.len() as u64, total);
        bytes
    }

    #[tokio::test]
    async fn test_archive_readable_by_zip_crate() {
        let text = "all work and no play makes jack a dull boy\n".repeat(200);
        let entries = vec![
            ZipEntry::directory("docs", at(1_700_000_000)),
            ZipEntry::file("docs/a.txt", at(1_700_000_000), text.clone().into_bytes(), Compression::Deflate)
                .unwrap(),
            ZipEntry::file("docs/b.bin", at(1_700_000_000), vec![1, 2, 3], Compression::Stored).unwrap(),
            ZipEntry::file("empty", at(1_700_000_000), Vec::new(), Compression::Deflate).unwrap(),
        ];
        assert_eq!(entries[1].method, Method::Deflated);

        let bytes = write_all(&entries).await;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 4);

        let names: Vec<_> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["docs/", "docs/a.txt", "docs/b.bin", "empty"]);

        assert!(archive.by_index(0).unwrap().is_dir());

        let mut contents = String::new();
        archive
            .by_name("docs/a.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, text);

        let mut bin = Vec::new();
        archive.by_name("docs/b.bin").unwrap().read_to_end(&mut bin).unwrap();
        assert_eq!(bin, vec![1, 2, 3]);

        let file = archive.by_name("docs/b.bin").unwrap();
        assert_eq!(file.unix_mode().map(|m| m & 0o777), Some(0o644));
    }

    #[tokio::test]
    async fn test_incompressible_data_falls_back_to_stored() {
        let entry = ZipEntry::file("x", at(0), vec![7], Compression::Deflate).unwrap();
        assert_eq!(entry.method, Method::Stored);
        assert_eq!(entry.data, vec![7]);
    }

    #[tokio::test]
    async fn test_empty_archive() {
        let bytes = write_all(&[]).await;
        assert_eq!(bytes.len(), 22);
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[tokio::test]
    async fn test_zip64_entry_count() {
        let count = ZIP64_COUNT_LIMIT + 10;
        let mut writer = ZipWriter::new(Vec::new());
        for i in 0..count {
            let entry = ZipEntry::directory(format!("d{i}"), at(1_600_000_000));
            writer.write_entry(&entry).await.unwrap();
        }
        let (bytes, _) = writer.finish().await.unwrap();

        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), count);
    }

    #[test]
    fn test_dos_datetime() {
        // 2023-11-14 22:13:20 UTC
        let (time, date) = dos_datetime(at(1_700_000_000));
        assert_eq!(time >> 11, 22);
        assert_eq!((time >> 5) & 0x3f, 13);
        assert_eq!((time & 0x1f) * 2, 20);
        assert_eq!((date >> 9) + 1980, 2023);
        assert_eq!((date >> 5) & 0x0f, 11);
        assert_eq!(date & 0x1f, 14);

        // Before the DOS epoch clamps to 1980-01-01.
        assert_eq!(dos_datetime(at(0)), (0, (1 << 5) | 1));
    }
}
