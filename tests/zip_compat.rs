//! End-to-end builds with the real `zip` binary
//!
//! Every test is skipped when `zip` is missing or cannot read named pipes.
//! Entries are checked by inflating them straight out of the archive bytes.

#![cfg(unix)]

use flate2::read::DeflateDecoder;
use pipe_zip::{ArchiveListing, ListedEntry, PipeZip, PipeZipError, PipelineConfig};
use std::io::{Cursor, Read};
use std::process::Command;
use tempfile::tempdir;

fn zip_available(config: &PipelineConfig) -> bool {
    match PipeZip::probe(config) {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping test: {e}");
            false
        }
    }
}

/// Decompress one entry using its local header offset
fn extract(archive: &[u8], entry: &ListedEntry) -> Vec<u8> {
    let header = entry.offset as usize;
    assert_eq!(&archive[header..header + 4], b"PK\x03\x04");
    let name_len = u16::from_le_bytes([archive[header + 26], archive[header + 27]]) as usize;
    let extra_len = u16::from_le_bytes([archive[header + 28], archive[header + 29]]) as usize;
    let start = header + 30 + name_len + extra_len;
    let data = &archive[start..start + entry.compressed_size as usize];

    match entry.compression_method {
        0 => data.to_vec(),
        8 => {
            let mut out = Vec::new();
            DeflateDecoder::new(data).read_to_end(&mut out).unwrap();
            out
        }
        other => panic!("unexpected compression method {other}"),
    }
}

#[test]
fn test_two_entries_roundtrip() {
    let base = tempdir().unwrap();
    let config = PipelineConfig::default().with_workspace_base(base.path());
    if !zip_available(&config) {
        return;
    }

    let mut zip = PipeZip::new(config).unwrap();
    zip.register("a.txt", "hello").unwrap();
    zip.register("dir/b.txt", "world").unwrap();
    let result = zip.build_and_teardown().unwrap();

    let listing = ArchiveListing::parse(result.archive()).unwrap();
    let names: Vec<_> = listing.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a.txt", "dir/b.txt"]);

    let a = listing.find_entry("a.txt").unwrap();
    assert_eq!(extract(result.archive(), a), b"hello");
    let b = listing.find_entry("dir/b.txt").unwrap();
    assert_eq!(extract(result.archive(), b), b"world");
    assert_eq!(b.crc32, crc32fast::hash(b"world"));

    // Nothing was left behind under the base directory
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[test]
fn test_large_entries_all_levels() {
    let base = tempdir().unwrap();
    let presets = [
        PipelineConfig::fast(),
        PipelineConfig::default(),
        PipelineConfig::best(),
    ];
    if !zip_available(&presets[0].clone().with_workspace_base(base.path())) {
        return;
    }

    let text: Vec<u8> = b"the quick brown fox jumps over the lazy dog\n"
        .iter()
        .copied()
        .cycle()
        .take(2 * 1024 * 1024)
        .collect();
    let noise: Vec<u8> = (0..512 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();

    for config in presets {
        let level = config.compression_level;
        let mut zip = PipeZip::new(config.with_workspace_base(base.path())).unwrap();
        zip.register_reader("text.txt", Cursor::new(text.clone())).unwrap();
        zip.register_seekable("noise.bin", Cursor::new(noise.clone()))
            .unwrap();
        let result = zip.build_and_teardown().unwrap();

        let listing = ArchiveListing::parse(result.archive()).unwrap();
        for (name, expected) in [("text.txt", &text), ("noise.bin", &noise)] {
            let entry = listing.find_entry(name).unwrap();
            let data = extract(result.archive(), entry);
            assert_eq!(data.len(), expected.len(), "{name} at level {level}");
            assert_eq!(crc32fast::hash(&data), entry.crc32);
            assert!(data == *expected, "{name} differs at level {level}");
        }
        // Repetitive text always deflates
        assert_eq!(listing.find_entry("text.txt").unwrap().compression_method, 8);
    }
}

#[test]
fn test_unzip_accepts_archive() {
    let base = tempdir().unwrap();
    let config = PipelineConfig::default().with_workspace_base(base.path());
    if !zip_available(&config) {
        return;
    }
    if Command::new("unzip").arg("-v").output().is_err() {
        eprintln!("skipping test: `unzip` not found");
        return;
    }

    let mut zip = PipeZip::new(config).unwrap();
    zip.register("nested/deeper/file.txt", "hello from a pipe")
        .unwrap();
    zip.register_bytes("zeros.bin", vec![0u8; 1024 * 1024]).unwrap();
    let result = zip.build_and_teardown().unwrap();

    let out_dir = tempdir().unwrap();
    let zip_path = out_dir.path().join("compat.zip");
    std::fs::write(&zip_path, result.archive()).unwrap();

    let output = Command::new("unzip")
        .arg("-t")
        .arg(&zip_path)
        .output()
        .expect("failed to run unzip");
    assert!(
        output.status.success(),
        "unzip reported failure: {} {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_source_error_with_real_zip() {
    let base = tempdir().unwrap();
    let config = PipelineConfig::default().with_workspace_base(base.path());
    if !zip_available(&config) {
        return;
    }

    struct Broken(usize);
    impl Read for Broken {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0 == 0 {
                return Err(std::io::Error::other("upstream went away"));
            }
            let n = self.0.min(buf.len());
            buf[..n].fill(b'z');
            self.0 -= n;
            Ok(n)
        }
    }

    let mut zip = PipeZip::new(config).unwrap();
    zip.register("ok.txt", "fine").unwrap();
    zip.register_reader("broken.txt", Broken(3)).unwrap();

    let err = zip.build_and_teardown().unwrap_err();
    assert!(matches!(err, PipeZipError::ProcessFailure { .. }));
    assert!(err.to_string().contains("broken.txt"));
}

#[test]
fn test_store_level_rejected_before_zip_runs() {
    let base = tempdir().unwrap();
    let mut config = PipelineConfig::default().with_workspace_base(base.path());
    if !zip_available(&config) {
        return;
    }
    // zip refuses -0 for pipe input; the build must not get that far
    config.compression_level = 0;

    let mut zip = PipeZip::new(config).unwrap();
    zip.register("a.txt", "hello").unwrap();

    let err = zip.build_and_teardown().unwrap_err();
    assert!(matches!(err, PipeZipError::ContractViolation(_)), "{err}");
}
