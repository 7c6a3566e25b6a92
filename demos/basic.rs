//! Basic usage example for pipe-zip
//!
//! Run with: RUST_LOG=pipe_zip=debug cargo run --example basic

use pipe_zip::{ArchiveListing, PipeZip, PipelineConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== pipe-zip Basic Example ===\n");

    let config = PipelineConfig::default();
    let caps = PipeZip::probe(&config)?;
    println!("Compressor: {}", caps.banner.as_deref().unwrap_or(&caps.program));

    println!("Creating test.zip...");
    let mut zip = PipeZip::new(config)?;
    zip.register_bytes("hello.txt", b"Hello, pipe-zip!".to_vec())?;
    zip.register("folder/nested.txt", "This is a nested file.")?;
    zip.register_reader("data.txt", &b"Line 1\nLine 2\nLine 3\n"[..])?;

    let result = zip.build()?;
    zip.teardown()?;
    std::fs::write("test.zip", result.archive())?;
    println!(
        "✓ Created test.zip ({} bytes in {:?})\n",
        result.archive().len(),
        result.elapsed()
    );

    println!("Entries in ZIP:");
    let listing = ArchiveListing::parse(result.archive())?;
    for entry in listing.entries() {
        println!(
            "  - {} ({} bytes, {} compressed, crc {:08x})",
            entry.name, entry.uncompressed_size, entry.compressed_size, entry.crc32
        );
    }

    println!("\n✓ All done!");

    Ok(())
}
