use std::io::Read;

use bytes::Bytes;
use chunk_archiver::chunk_writer::index::ChunkIndex;
use flate2::read::GzDecoder;

/// Dumps a chunk index, and checks it against its data file when one is given.
///
/// usage: chunk-archiver <index file> [data file]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);

    let Some(index_path) = args.next() else {
        tracing::error!("usage: chunk-archiver <index file> [data file]");
        std::process::exit(2);
    };

    let index = ChunkIndex::try_from(Bytes::from(std::fs::read(&index_path)?))?;

    tracing::info!(
        "{} covers offsets [{}, {}) with {} records in {} blocks",
        index_path,
        index.start_offset,
        index.end_offset,
        index.record_count(),
        index.blocks.len()
    );

    for block in &index.blocks {
        tracing::info!("{:#?}", block);
    }

    if let Some(data_path) = args.next() {
        let data = std::fs::read(&data_path)?;

        for block in &index.blocks {
            let range = block
                .byte_offset
                .checked_add(block.byte_length)
                .and_then(|end| {
                    let start = usize::try_from(block.byte_offset).ok()?;
                    Some(start..usize::try_from(end).ok()?)
                });

            let Some(compressed) = range.and_then(|range| data.get(range)) else {
                tracing::error!(
                    "Block at byte {} with length {} is past the end of {}",
                    block.byte_offset,
                    block.byte_length,
                    data_path
                );
                std::process::exit(1);
            };

            let mut lines = Vec::new();
            GzDecoder::new(compressed).read_to_end(&mut lines)?;

            let found = lines.iter().filter(|b| **b == b'\n').count();

            if found != usize::try_from(block.num_records)? {
                tracing::error!(
                    "Block at offset {} should hold {} records but holds {}",
                    block.first_record_offset,
                    block.num_records,
                    found
                );
                std::process::exit(1);
            }
        }

        tracing::info!("{} matches its index", data_path);
    }

    Ok(())
}
