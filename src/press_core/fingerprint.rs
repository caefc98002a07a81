//! Fast file fingerprinting for the scanner's modification detection.
//!
//! The fingerprint is not a cryptographic commitment over the whole file:
//! for anything of 8 MiB or more only the first and last 4 MiB are hashed,
//! which is enough to catch re-muxes and replacements without reading
//! multi-gigabyte files end to end.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

const SPLIT_THRESHOLD: u64 = 8 * 1024 * 1024;
const SAMPLE_BYTES: u64 = 4 * 1024 * 1024;

/// Hash a file: whole contents below 8 MiB, first 4 MiB plus last 4 MiB at
/// or above it. Stable across calls for an unchanged file.
pub fn file_fingerprint(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open {} for fingerprinting", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    let mut hasher = blake3::Hasher::new();
    if size < SPLIT_THRESHOLD {
        let mut contents = Vec::with_capacity(size as usize);
        file.read_to_end(&mut contents)
            .with_context(|| format!("failed to read {}", path.display()))?;
        hasher.update(&contents);
    } else {
        let mut head = vec![0u8; SAMPLE_BYTES as usize];
        file.read_exact(&mut head)
            .with_context(|| format!("failed to read head of {}", path.display()))?;
        hasher.update(&head);

        file.seek(SeekFrom::End(-(SAMPLE_BYTES as i64)))
            .with_context(|| format!("failed to seek in {}", path.display()))?;
        let mut tail = vec![0u8; SAMPLE_BYTES as usize];
        file.read_exact(&mut tail)
            .with_context(|| format!("failed to read tail of {}", path.display()))?;
        hasher.update(&tail);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
