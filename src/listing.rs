//! Central directory listing of a finished archive
//!
//! The compressor is a black box, so a build checks what it actually wrote:
//! the central directory must name exactly the registered entries, with the
//! sizes and CRC-32 values the feeders observed while streaming. Only the
//! directory is parsed; entry data is never decompressed.

use crate::error::{PipeZipError, Result};
use crate::feeder::FeedReport;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// ZIP central directory signature
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x02014b50;

/// ZIP end of central directory signature
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06054b50;

/// ZIP64 end of central directory record signature
const ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06064b50;

/// Fixed size of the end of central directory record
const EOCD_SIZE: usize = 22;

/// Largest span the EOCD can sit from the end (record + max comment)
const EOCD_SEARCH_SPAN: u64 = 65557;

/// Entry as listed in the central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression_method: u16,
    /// Offset of the local file header
    pub offset: u64,
}

/// Parsed central directory of an in-memory archive
#[derive(Debug, Clone, Default)]
pub struct ArchiveListing {
    entries: Vec<ListedEntry>,
}

impl ArchiveListing {
    /// Parse the central directory of `archive`
    pub fn parse(archive: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(archive);
        let entries = read_central_directory(&mut cursor)?;
        Ok(Self { entries })
    }

    /// Entries in central directory order
    pub fn entries(&self) -> &[ListedEntry] {
        &self.entries
    }

    /// Find an entry by name
    pub fn find_entry(&self, name: &str) -> Option<&ListedEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Check that `archive` lists exactly the fed entries with matching sizes and CRCs
pub fn verify(archive: &[u8], reports: &[FeedReport]) -> Result<()> {
    let listing = ArchiveListing::parse(archive)?;

    let mut listed: HashMap<&str, &ListedEntry> = HashMap::with_capacity(listing.entries.len());
    for entry in &listing.entries {
        if listed.insert(entry.name.as_str(), entry).is_some() {
            return Err(PipeZipError::InvalidArchive(format!(
                "entry '{}' is listed twice",
                entry.name
            )));
        }
    }

    for report in reports {
        let entry = listed.remove(report.name.as_str()).ok_or_else(|| {
            PipeZipError::InvalidArchive(format!("entry '{}' is missing", report.name))
        })?;

        if entry.uncompressed_size != report.bytes {
            return Err(PipeZipError::InvalidArchive(format!(
                "entry '{}' holds {} bytes, {} were fed",
                report.name, entry.uncompressed_size, report.bytes
            )));
        }
        if entry.crc32 != report.crc32 {
            return Err(PipeZipError::InvalidArchive(format!(
                "entry '{}' has CRC-32 0x{:08x}, fed bytes have 0x{:08x}",
                report.name, entry.crc32, report.crc32
            )));
        }
    }

    if let Some(extra) = listed.keys().next() {
        return Err(PipeZipError::InvalidArchive(format!(
            "unexpected entry '{}'",
            extra
        )));
    }

    Ok(())
}

/// A valid archive without entries: a lone end of central directory record
pub fn empty_archive() -> Vec<u8> {
    let mut archive = Vec::with_capacity(EOCD_SIZE);
    archive.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
    archive.extend_from_slice(&0u16.to_le_bytes()); // disk number
    archive.extend_from_slice(&0u16.to_le_bytes()); // disk with central dir
    archive.extend_from_slice(&0u16.to_le_bytes()); // entries on this disk
    archive.extend_from_slice(&0u16.to_le_bytes()); // total entries
    archive.extend_from_slice(&0u32.to_le_bytes()); // central dir size
    archive.extend_from_slice(&0u32.to_le_bytes()); // central dir offset
    archive.extend_from_slice(&0u16.to_le_bytes()); // comment len
    archive
}

fn read_central_directory(cursor: &mut Cursor<&[u8]>) -> Result<Vec<ListedEntry>> {
    let eocd_offset = find_eocd(cursor.get_ref())?;
    cursor.seek(SeekFrom::Start(eocd_offset))?;

    let signature = read_u32_le(cursor)?;
    if signature != END_OF_CENTRAL_DIRECTORY_SIGNATURE {
        return Err(PipeZipError::InvalidArchive(format!(
            "invalid end of central directory signature: 0x{:08x}",
            signature
        )));
    }

    // Skip disk number fields and entries on this disk
    cursor.seek(SeekFrom::Current(6))?;

    // Placeholders 0xFFFF/0xFFFFFFFF mean the real values live in the ZIP64 record
    let total_entries_16 = read_u16_le(cursor)?;
    let cd_size_32 = read_u32_le(cursor)?;
    let cd_offset_32 = read_u32_le(cursor)?;

    let mut total_entries = total_entries_16 as u64;
    let mut cd_size = cd_size_32 as u64;
    let mut cd_offset = cd_offset_32 as u64;
    // The directory must end where the (ZIP64) end record starts
    let mut cd_end = eocd_offset;

    if total_entries_16 == 0xFFFF || cd_size_32 == 0xFFFFFFFF || cd_offset_32 == 0xFFFFFFFF {
        let zip64 = read_zip64_eocd(cursor, eocd_offset)?;
        total_entries = zip64.total_entries;
        cd_size = zip64.cd_size;
        cd_offset = zip64.cd_offset;
        cd_end = zip64.record_offset;
    }

    if cd_offset > cd_end {
        return Err(PipeZipError::InvalidArchive(
            "central directory starts after its end record".to_string(),
        ));
    }

    cursor.seek(SeekFrom::Start(cd_offset))?;

    // Each record is at least 46 bytes; don't trust the count for the allocation
    let capacity = total_entries.min(cursor.get_ref().len() as u64 / 46) as usize;
    let mut entries = Vec::with_capacity(capacity);
    for _ in 0..total_entries {
        let signature = read_u32_le(cursor)?;
        if signature != CENTRAL_DIRECTORY_SIGNATURE {
            return Err(PipeZipError::InvalidArchive(format!(
                "invalid central directory signature: 0x{:08x}",
                signature
            )));
        }

        // Skip version made by, version needed, flags
        cursor.seek(SeekFrom::Current(6))?;
        let compression_method = read_u16_le(cursor)?;

        // Skip modification time and date
        cursor.seek(SeekFrom::Current(4))?;
        let crc32 = read_u32_le(cursor)?;

        let compressed_size_32 = read_u32_le(cursor)?;
        let uncompressed_size_32 = read_u32_le(cursor)?;
        let filename_len = read_u16_le(cursor)? as usize;
        let extra_len = read_u16_le(cursor)? as usize;
        let comment_len = read_u16_le(cursor)? as i64;

        // Skip disk number, internal attributes, external attributes
        cursor.seek(SeekFrom::Current(8))?;
        let offset_32 = read_u32_le(cursor)?;

        let mut filename = vec![0u8; filename_len];
        cursor.read_exact(&mut filename).map_err(truncated)?;
        let name = String::from_utf8_lossy(&filename).into_owned();

        let mut extra = vec![0u8; extra_len];
        cursor.read_exact(&mut extra).map_err(truncated)?;

        cursor.seek(SeekFrom::Current(comment_len))?;
        if cursor.position() > cd_end {
            return Err(PipeZipError::InvalidArchive(format!(
                "central directory record for '{}' runs into the end record",
                name
            )));
        }

        let mut sizes = Zip64Sizes {
            uncompressed: uncompressed_size_32 as u64,
            compressed: compressed_size_32 as u64,
            offset: offset_32 as u64,
        };
        if uncompressed_size_32 == 0xFFFFFFFF
            || compressed_size_32 == 0xFFFFFFFF
            || offset_32 == 0xFFFFFFFF
        {
            sizes.apply_extra(
                &extra,
                uncompressed_size_32 == 0xFFFFFFFF,
                compressed_size_32 == 0xFFFFFFFF,
                offset_32 == 0xFFFFFFFF,
            );
        }

        entries.push(ListedEntry {
            name,
            crc32,
            compressed_size: sizes.compressed,
            uncompressed_size: sizes.uncompressed,
            compression_method,
            offset: sizes.offset,
        });
    }

    let consumed = cursor.position() - cd_offset;
    if consumed != cd_size {
        return Err(PipeZipError::InvalidArchive(format!(
            "central directory spans {} bytes, end record declares {}",
            consumed, cd_size
        )));
    }

    Ok(entries)
}

struct Zip64Sizes {
    uncompressed: u64,
    compressed: u64,
    offset: u64,
}

impl Zip64Sizes {
    /// Replace placeholder values from the ZIP64 extra field (id 0x0001)
    ///
    /// The field only carries the values whose 32-bit slot was saturated, in
    /// the order uncompressed size, compressed size, header offset.
    fn apply_extra(&mut self, extra: &[u8], uncompressed: bool, compressed: bool, offset: bool) {
        let mut i = 0usize;
        while i + 4 <= extra.len() {
            let id = u16::from_le_bytes([extra[i], extra[i + 1]]);
            let data_len = u16::from_le_bytes([extra[i + 2], extra[i + 3]]) as usize;
            i += 4;
            if i + data_len > extra.len() {
                return;
            }
            if id == 0x0001 {
                let mut values = extra[i..i + data_len]
                    .chunks_exact(8)
                    .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8])));
                if uncompressed {
                    if let Some(value) = values.next() {
                        self.uncompressed = value;
                    }
                }
                if compressed {
                    if let Some(value) = values.next() {
                        self.compressed = value;
                    }
                }
                if offset {
                    if let Some(value) = values.next() {
                        self.offset = value;
                    }
                }
                return;
            }
            i += data_len;
        }
    }
}

/// Fields of the ZIP64 end of central directory record
struct Zip64Eocd {
    total_entries: u64,
    cd_size: u64,
    cd_offset: u64,
    /// Where the record itself starts
    record_offset: u64,
}

/// Locate and read the ZIP64 end of central directory record
fn read_zip64_eocd(cursor: &mut Cursor<&[u8]>, eocd_offset: u64) -> Result<Zip64Eocd> {
    // The locator (50 4b 06 07) sits right before the classic record
    let data = cursor.get_ref();
    let search_start = eocd_offset.saturating_sub(EOCD_SEARCH_SPAN) as usize;
    let window = &data[search_start..eocd_offset as usize];
    let locator_pos = window
        .windows(4)
        .rposition(|w| w == [0x50, 0x4b, 0x06, 0x07])
        .ok_or_else(|| PipeZipError::InvalidArchive("ZIP64 EOCD locator not found".to_string()))?;

    // Locator: signature(4), disk(4), relative offset of the ZIP64 record(8), disks(4)
    cursor.seek(SeekFrom::Start((search_start + locator_pos + 8) as u64))?;
    let zip64_eocd_offset = read_u64_le(cursor)?;

    cursor.seek(SeekFrom::Start(zip64_eocd_offset))?;
    let signature = read_u32_le(cursor)?;
    if signature != ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE {
        return Err(PipeZipError::InvalidArchive(format!(
            "invalid ZIP64 EOCD signature: 0x{:08x}",
            signature
        )));
    }

    // Skip record size(8), versions(4), disk numbers(8), entries on this disk(8)
    cursor.seek(SeekFrom::Current(28))?;
    let total_entries = read_u64_le(cursor)?;
    let cd_size = read_u64_le(cursor)?;
    let cd_offset = read_u64_le(cursor)?;

    Ok(Zip64Eocd {
        total_entries,
        cd_size,
        cd_offset,
        record_offset: zip64_eocd_offset,
    })
}

/// Find the end of central directory record by scanning backwards from the end
fn find_eocd(data: &[u8]) -> Result<u64> {
    if data.len() < EOCD_SIZE {
        return Err(PipeZipError::InvalidArchive(format!(
            "archive too short ({} bytes)",
            data.len()
        )));
    }

    let search_start = (data.len() as u64).saturating_sub(EOCD_SEARCH_SPAN) as usize;
    data[search_start..]
        .windows(4)
        .rposition(|w| w == [0x50, 0x4b, 0x05, 0x06])
        .map(|pos| (search_start + pos) as u64)
        .ok_or_else(|| {
            PipeZipError::InvalidArchive("end of central directory not found".to_string())
        })
}

fn read_u16_le(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_le(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_le_bytes(buf))
}

fn truncated(_: std::io::Error) -> PipeZipError {
    PipeZipError::InvalidArchive("truncated central directory".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembled stored archive, laid out like a streamed zip output
    fn stored_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for (name, data) in files {
            let offset = out.len() as u32;
            let crc = crc32fast::hash(data);

            out.extend_from_slice(&0x04034b50u32.to_le_bytes());
            out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);

            central.extend_from_slice(&CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
            central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            central.extend_from_slice(&crc.to_le_bytes());
            central.extend_from_slice(&(data.len() as u32).to_le_bytes());
            central.extend_from_slice(&(data.len() as u32).to_le_bytes());
            central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0; 12]);
            central.extend_from_slice(&offset.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
        }

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&(files.len() as u16).to_le_bytes());
        out.extend_from_slice(&(files.len() as u16).to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    fn report(name: &str, data: &[u8]) -> FeedReport {
        FeedReport {
            name: name.to_string(),
            bytes: data.len() as u64,
            crc32: crc32fast::hash(data),
        }
    }

    #[test]
    fn test_parse_listing() {
        let archive = stored_archive(&[("a.txt", b"hello"), ("dir/b.txt", b"world")]);
        let listing = ArchiveListing::parse(&archive).unwrap();

        assert_eq!(listing.entries().len(), 2);
        let b = listing.find_entry("dir/b.txt").unwrap();
        assert_eq!(b.uncompressed_size, 5);
        assert_eq!(b.crc32, crc32fast::hash(b"world"));
        assert_eq!(b.compression_method, 0);
        assert_eq!(listing.entries()[0].offset, 0);
    }

    #[test]
    fn test_verify_accepts_matching_archive() {
        let archive = stored_archive(&[("a.txt", b"hello"), ("dir/b.txt", b"world")]);
        let reports = [report("dir/b.txt", b"world"), report("a.txt", b"hello")];
        verify(&archive, &reports).unwrap();
    }

    #[test]
    fn test_verify_rejects_missing_extra_and_mismatch() {
        let archive = stored_archive(&[("a.txt", b"hello")]);

        let err = verify(&archive, &[report("a.txt", b"hello"), report("b.txt", b"")]).unwrap_err();
        assert!(err.to_string().contains("'b.txt' is missing"));

        let err = verify(&archive, &[]).unwrap_err();
        assert!(err.to_string().contains("unexpected entry 'a.txt'"));

        let err = verify(&archive, &[report("a.txt", b"hell")]).unwrap_err();
        assert!(err.to_string().contains("holds 5 bytes, 4 were fed"));

        let err = verify(&archive, &[report("a.txt", b"HELLO")]).unwrap_err();
        assert!(err.to_string().contains("CRC-32"));
    }

    #[test]
    fn test_empty_archive_parses_empty() {
        let archive = empty_archive();
        assert_eq!(archive.len(), EOCD_SIZE);
        assert!(ArchiveListing::parse(&archive).unwrap().entries().is_empty());
        verify(&archive, &[]).unwrap();
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            ArchiveListing::parse(b"helloworld"),
            Err(PipeZipError::InvalidArchive(_))
        ));
        assert!(matches!(
            ArchiveListing::parse(&[0u8; 100]),
            Err(PipeZipError::InvalidArchive(_))
        ));

        // Truncated central directory
        let mut archive = stored_archive(&[("a.txt", b"hello")]);
        let eocd = archive.split_off(archive.len() - EOCD_SIZE);
        archive.truncate(archive.len() - 10);
        archive.extend_from_slice(&eocd);
        assert!(ArchiveListing::parse(&archive).is_err());
    }

    #[test]
    fn test_record_running_into_end_record_is_rejected() {
        // Cut the directory short; the record now overlaps the end record
        let mut archive = stored_archive(&[("a.txt", b"hello"), ("b.txt", b"world")]);
        let eocd = archive.split_off(archive.len() - EOCD_SIZE);
        archive.truncate(archive.len() - 3);
        archive.extend_from_slice(&eocd);

        let err = ArchiveListing::parse(&archive).unwrap_err();
        assert!(err.to_string().contains("runs into the end record"), "{err}");
        assert!(verify(&archive, &[]).is_err());
    }

    #[test]
    fn test_directory_size_mismatch_is_rejected() {
        let mut archive = stored_archive(&[("a.txt", b"hello")]);
        // Central directory size field of the end record
        let size_at = archive.len() - EOCD_SIZE + 12;
        let declared = u32::from_le_bytes(archive[size_at..size_at + 4].try_into().unwrap());
        archive[size_at..size_at + 4].copy_from_slice(&(declared - 1).to_le_bytes());

        let err = ArchiveListing::parse(&archive).unwrap_err();
        assert!(err.to_string().contains("end record declares"), "{err}");
    }

    /// Rewrite a plain archive's end record as ZIP64 record + locator + placeholder EOCD
    fn to_zip64(mut archive: Vec<u8>, cd_size: u64) -> Vec<u8> {
        let eocd = archive.split_off(archive.len() - EOCD_SIZE);
        let entries = u16::from_le_bytes([eocd[10], eocd[11]]) as u64;
        let cd_offset = u32::from_le_bytes(eocd[16..20].try_into().unwrap()) as u64;

        let record_offset = archive.len() as u64;
        archive.extend_from_slice(&ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        archive.extend_from_slice(&44u64.to_le_bytes());
        archive.extend_from_slice(&[45, 0, 45, 0]);
        archive.extend_from_slice(&[0; 8]);
        archive.extend_from_slice(&entries.to_le_bytes());
        archive.extend_from_slice(&entries.to_le_bytes());
        archive.extend_from_slice(&cd_size.to_le_bytes());
        archive.extend_from_slice(&cd_offset.to_le_bytes());

        archive.extend_from_slice(&0x07064b50u32.to_le_bytes());
        archive.extend_from_slice(&0u32.to_le_bytes());
        archive.extend_from_slice(&record_offset.to_le_bytes());
        archive.extend_from_slice(&1u32.to_le_bytes());

        archive.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        archive.extend_from_slice(&[0; 4]);
        archive.extend_from_slice(&[0xFF; 4]);
        archive.extend_from_slice(&[0xFF; 8]);
        archive.extend_from_slice(&0u16.to_le_bytes());
        archive
    }

    #[test]
    fn test_zip64_end_record() {
        let plain = stored_archive(&[("a.txt", b"hello"), ("dir/b.txt", b"world")]);
        // Two records: 46 + 5 and 46 + 9 bytes
        let cd_size = 51 + 55;

        let archive = to_zip64(plain.clone(), cd_size);
        let listing = ArchiveListing::parse(&archive).unwrap();
        assert_eq!(listing.entries().len(), 2);
        assert_eq!(listing.entries()[1].name, "dir/b.txt");

        // The ZIP64 size is the one checked
        let archive = to_zip64(plain, cd_size + 1);
        assert!(matches!(
            ArchiveListing::parse(&archive),
            Err(PipeZipError::InvalidArchive(_))
        ));
    }

    #[test]
    fn test_zip64_extra_field() {
        let mut sizes = Zip64Sizes {
            uncompressed: 0xFFFFFFFF,
            compressed: 0xFFFFFFFF,
            offset: 12,
        };
        let mut extra = Vec::new();
        extra.extend_from_slice(&0x5455u16.to_le_bytes()); // unrelated field first
        extra.extend_from_slice(&1u16.to_le_bytes());
        extra.push(0);
        extra.extend_from_slice(&0x0001u16.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&5_000_000_000u64.to_le_bytes());
        extra.extend_from_slice(&4_000_000_000u64.to_le_bytes());

        sizes.apply_extra(&extra, true, true, false);
        assert_eq!(sizes.uncompressed, 5_000_000_000);
        assert_eq!(sizes.compressed, 4_000_000_000);
        assert_eq!(sizes.offset, 12);
    }
}
