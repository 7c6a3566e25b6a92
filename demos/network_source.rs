//! Archive data arriving over a socket without buffering it first
//!
//! A local TCP server stands in for a remote source; its stream is registered
//! as a sequential entry next to an in-memory one.
//!
//! Run with: RUST_LOG=pipe_zip=debug cargo run --example network_source

use pipe_zip::{PipeZip, PipelineConfig};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = thread::spawn(move || -> std::io::Result<()> {
        let (mut socket, _) = listener.accept()?;
        for i in 0..10_000 {
            writeln!(socket, "record {i}: the quick brown fox jumps over the lazy dog")?;
        }
        Ok(())
    });

    let mut zip = PipeZip::new(PipelineConfig::fast())?;
    zip.register("README.txt", "Records streamed from a socket.\n")?;
    zip.register_reader("records/stream.log", TcpStream::connect(addr)?)?;

    let result = zip.build_and_teardown()?;
    server.join().map_err(|_| "server thread panicked")??;

    for entry in result.entries() {
        println!("{}: {} bytes (crc {:08x})", entry.name, entry.bytes, entry.crc32);
    }
    std::fs::write("network.zip", result.archive())?;
    println!(
        "Wrote network.zip: {} bytes from {} input bytes in {:?}",
        result.archive().len(),
        result.total_bytes(),
        result.elapsed()
    );

    Ok(())
}
