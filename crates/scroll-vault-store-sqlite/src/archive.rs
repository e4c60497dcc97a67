use std::io::{BufRead, BufReader, Read, Write};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use scroll_vault_core::wire::CycleView;
use scroll_vault_core::MemoryCycle;
use time::OffsetDateTime;

use crate::SqliteStore;

/// A gzip-compressed newline-delimited JSON export of the whole vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveExport {
    pub file_name: String,
    pub records: usize,
    pub bytes: Vec<u8>,
}

impl SqliteStore {
    /// Export every cycle, lowest `t` first, one [`CycleView`] per line.
    ///
    /// # Errors
    /// Returns an error when the cycles cannot be read or compressed.
    pub fn export_archive(&self) -> Result<ArchiveExport> {
        let cycles = self.list_cycles_ascending()?;
        let bytes = write_archive(Vec::new(), &cycles)?;
        Ok(ArchiveExport {
            file_name: archive_file_name(OffsetDateTime::now_utc()),
            records: cycles.len(),
            bytes,
        })
    }
}

/// Gzip NDJSON encoding of `cycles` into `writer`, which is handed back once the
/// gzip trailer is written.
///
/// # Errors
/// Returns an error when a line cannot be serialized or written.
pub fn write_archive<W: Write>(writer: W, cycles: &[MemoryCycle]) -> Result<W> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    for (index, cycle) in cycles.iter().enumerate() {
        serde_json::to_writer(&mut encoder, &CycleView::from(cycle))
            .with_context(|| format!("failed to serialize archive line {}", index + 1))?;
        encoder
            .write_all(b"\n")
            .with_context(|| format!("failed to write archive line {}", index + 1))?;
    }
    encoder.finish().context("failed to finish gzip archive")
}

/// Decode an archive produced by [`write_archive`]. Blank lines are skipped.
///
/// # Errors
/// Returns an error when the input is not gzip or a line is not a cycle.
pub fn read_archive<R: Read>(reader: R) -> Result<Vec<CycleView>> {
    let reader = BufReader::new(GzDecoder::new(reader));
    let mut views = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read archive line {}", index + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let view = serde_json::from_str(trimmed)
            .with_context(|| format!("failed to parse archive line {}", index + 1))?;
        views.push(view);
    }

    Ok(views)
}

/// `scroll_vault_archive_<UTC timestamp>.jsonl.gz`, with a timestamp safe for file names.
#[must_use]
pub fn archive_file_name(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!(
        "scroll_vault_archive_{:04}{:02}{:02}T{:02}{:02}{:02}Z.jsonl.gz",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}
