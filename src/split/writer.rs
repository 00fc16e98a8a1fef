use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::planner::{SplitPlan, SplitStrategy};
use crate::config::SplittingConfig;
use crate::error::{DocsplitError, Result};

/// Upper bound of the copy buffer for opaque splits
const MAX_COPY_BUFFER: u64 = 8 * 1024 * 1024;

/// A part file flushed to disk, ready to be registered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WrittenPart {
    pub sequence_index: u32,
    pub total_parts: u32,
    pub path: PathBuf,
    pub byte_size: u64,
}

/// `<basename>_part<i>of<N>.<ext>`, or without the extension when there is none.
pub fn part_file_name(basename: &str, index: u32, total: u32, ext: &str) -> String {
    if ext.is_empty() {
        format!("{}_part{}of{}", basename, index, total)
    } else {
        format!("{}_part{}of{}.{}", basename, index, total, ext)
    }
}

fn pending_file_name(basename: &str, index: u32) -> String {
    format!(".{}_part{}.pending", basename, index)
}

fn write_err(context: &str, path: &Path, e: impl std::fmt::Display) -> DocsplitError {
    DocsplitError::Write(format!("{} {}: {}", context, path.display(), e))
}

fn name_parts(original_filename: &str) -> (String, String) {
    let name = Path::new(original_filename);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string());
    let ext = name
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    (stem, ext)
}

/// Flush userspace buffers and fsync, so a returned part is durable.
fn finish_file(writer: BufWriter<File>, path: &Path) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| write_err("cannot flush", path, e.error()))?;
    file.sync_all().map_err(|e| write_err("cannot sync", path, e))
}

/// Executes a split plan, writing ordered part files into a working area.
#[derive(Debug, Clone)]
pub struct PartWriter {
    config: SplittingConfig,
}

impl PartWriter {
    pub fn new(config: SplittingConfig) -> Self {
        Self { config }
    }

    /// Write all parts of `source` into `area_dir`.
    ///
    /// Parts come back in sequence order with their final names. On error
    /// some files may remain in `area_dir`; the caller discards the area.
    pub fn write(
        &self,
        source: &Path,
        original_filename: &str,
        plan: &SplitPlan,
        area_dir: &Path,
    ) -> Result<Vec<WrittenPart>> {
        self.write_loaded(source, None, original_filename, plan, area_dir)
    }

    /// `write` with the source PDF already parsed by the classifier.
    pub fn write_loaded(
        &self,
        source: &Path,
        loaded: Option<lopdf::Document>,
        original_filename: &str,
        plan: &SplitPlan,
        area_dir: &Path,
    ) -> Result<Vec<WrittenPart>> {
        let (basename, ext) = name_parts(original_filename);
        let parts = match plan.strategy {
            SplitStrategy::PaginatedBinary => {
                let document = match loaded {
                    Some(document) => document,
                    None => lopdf::Document::load(source).map_err(|e| write_err("cannot load", source, e))?,
                };
                self.write_paginated(&document, &basename, &ext, plan.chunk_unit_size, area_dir)?
            }
            SplitStrategy::DelimitedText => self.write_text(source, &basename, &ext, area_dir)?,
            SplitStrategy::OpaqueBinary => {
                self.write_opaque(source, &basename, &ext, plan.chunk_unit_size, area_dir)?
            }
        };

        if parts.len() != plan.estimated_chunks {
            log::debug!(
                "Estimate mismatch for {}: planned {} parts, wrote {}",
                original_filename,
                plan.estimated_chunks,
                parts.len()
            );
        }
        Ok(parts)
    }

    fn write_paginated(
        &self,
        document: &lopdf::Document,
        basename: &str,
        ext: &str,
        pages_per_part: u64,
        area_dir: &Path,
    ) -> Result<Vec<WrittenPart>> {
        let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        let per_part = pages_per_part.max(1) as usize;
        let chunks: Vec<&[u32]> = page_numbers.chunks(per_part).collect();
        let total = chunks.len() as u32;

        let mut written = Vec::with_capacity(chunks.len());
        for (i, keep) in chunks.iter().enumerate() {
            let index = i as u32 + 1;
            let to_delete: Vec<u32> = page_numbers
                .iter()
                .copied()
                .filter(|page| !keep.contains(page))
                .collect();

            let mut part = document.clone();
            part.delete_pages(&to_delete);
            part.prune_objects();

            let path = area_dir.join(part_file_name(basename, index, total, ext));
            let file = File::create(&path).map_err(|e| write_err("cannot create", &path, e))?;
            let mut out = BufWriter::new(file);
            part.save_to(&mut out).map_err(|e| write_err("cannot write", &path, e))?;
            finish_file(out, &path)?;

            let byte_size = fs::metadata(&path)?.len();
            written.push(WrittenPart {
                sequence_index: index,
                total_parts: total,
                path,
                byte_size,
            });
        }
        Ok(written)
    }

    fn write_text(&self, source: &Path, basename: &str, ext: &str, area_dir: &Path) -> Result<Vec<WrittenPart>> {
        let chunk_chars = self.config.char_chunk_size.max(1);
        let file = File::open(source).map_err(|e| write_err("cannot open", source, e))?;
        let mut reader = BufReader::with_capacity(self.config.read_buffer_bytes, file);
        let mut buf = vec![0u8; self.config.read_buffer_bytes.max(4)];
        let mut carry: Vec<u8> = Vec::new();
        let mut decoded = String::new();

        let mut finished: Vec<(PathBuf, u64)> = Vec::new();
        let mut current: Option<PendingPart> = None;

        loop {
            let n = reader.read(&mut buf).map_err(|e| write_err("cannot read", source, e))?;
            let eof = n == 0;
            carry.extend_from_slice(&buf[..n]);

            decoded.clear();
            let consumed = decode_utf8(&carry, eof, &mut decoded);
            carry.drain(..consumed);

            let mut rest = decoded.as_str();
            while !rest.is_empty() {
                if current.is_none() {
                    let index = finished.len() as u32 + 1;
                    let path = area_dir.join(pending_file_name(basename, index));
                    current = Some(PendingPart::create(path)?);
                }
                let Some(part) = current.as_mut() else { break };

                let room = chunk_chars - part.chars;
                let cut = rest.char_indices().nth(room).map(|(i, _)| i).unwrap_or(rest.len());
                let (head, tail) = rest.split_at(cut);
                part.push(head)?;
                rest = tail;

                if part.chars == chunk_chars {
                    if let Some(full) = current.take() {
                        finished.push(full.finish()?);
                    }
                }
            }

            if eof {
                break;
            }
        }
        if let Some(last) = current.take() {
            finished.push(last.finish()?);
        }

        // Second phase: the true count is known, give every part its final name.
        let total = finished.len() as u32;
        let mut written = Vec::with_capacity(finished.len());
        for (i, (pending, byte_size)) in finished.into_iter().enumerate() {
            let index = i as u32 + 1;
            let path = area_dir.join(part_file_name(basename, index, total, ext));
            fs::rename(&pending, &path).map_err(|e| write_err("cannot rename", &pending, e))?;
            written.push(WrittenPart {
                sequence_index: index,
                total_parts: total,
                path,
                byte_size,
            });
        }
        Ok(written)
    }

    fn write_opaque(
        &self,
        source: &Path,
        basename: &str,
        ext: &str,
        bytes_per_part: u64,
        area_dir: &Path,
    ) -> Result<Vec<WrittenPart>> {
        let per_part = bytes_per_part.max(1);
        let file = File::open(source).map_err(|e| write_err("cannot open", source, e))?;
        let source_size = file.metadata()?.len();
        let total = if source_size == 0 {
            0
        } else {
            ((source_size + per_part - 1) / per_part) as u32
        };

        let mut reader = file;
        let mut buf = vec![0u8; per_part.min(MAX_COPY_BUFFER) as usize];
        let mut written = Vec::with_capacity(total as usize);

        for index in 1..=total {
            let path = area_dir.join(part_file_name(basename, index, total, ext));
            let out_file = File::create(&path).map_err(|e| write_err("cannot create", &path, e))?;
            let mut out = BufWriter::new(out_file);
            let mut remaining = per_part;
            let mut byte_size = 0u64;

            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = reader
                    .read(&mut buf[..want])
                    .map_err(|e| write_err("cannot read", source, e))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).map_err(|e| write_err("cannot write", &path, e))?;
                remaining -= n as u64;
                byte_size += n as u64;
            }
            finish_file(out, &path)?;

            if byte_size == 0 {
                return Err(write_err("source shrank while splitting", source, format!("part {}", index)));
            }
            written.push(WrittenPart {
                sequence_index: index,
                total_parts: total,
                path,
                byte_size,
            });
        }
        Ok(written)
    }
}

/// A text part still being written under its provisional name
struct PendingPart {
    path: PathBuf,
    out: BufWriter<File>,
    chars: usize,
    bytes: u64,
}

impl PendingPart {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| write_err("cannot create", &path, e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            chars: 0,
            bytes: 0,
        })
    }

    fn push(&mut self, text: &str) -> Result<()> {
        self.out
            .write_all(text.as_bytes())
            .map_err(|e| write_err("cannot write", &self.path, e))?;
        self.chars += text.chars().count();
        self.bytes += text.len() as u64;
        Ok(())
    }

    fn finish(self) -> Result<(PathBuf, u64)> {
        finish_file(self.out, &self.path)?;
        Ok((self.path, self.bytes))
    }
}

/// Decode as much of `bytes` as possible into `out`, returning bytes consumed.
///
/// Invalid sequences become U+FFFD. An incomplete sequence at the end is left
/// unconsumed unless `eof` is set.
fn decode_utf8(bytes: &[u8], eof: bool, out: &mut String) -> usize {
    let mut pos = 0;
    loop {
        match std::str::from_utf8(&bytes[pos..]) {
            Ok(valid) => {
                out.push_str(valid);
                return bytes.len();
            }
            Err(e) => {
                let valid_end = pos + e.valid_up_to();
                out.push_str(std::str::from_utf8(&bytes[pos..valid_end]).unwrap_or_default());
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pos = valid_end + len;
                    }
                    None if eof => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        return bytes.len();
                    }
                    None => return valid_end,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::classifier::SplitReason;
    use crate::split::test_pdf::{build_pdf, page_count};
    use tempfile::TempDir;

    fn small_config() -> SplittingConfig {
        SplittingConfig {
            max_file_size_bytes: 1000,
            page_chunk_size: 10,
            char_chunk_size: 100,
            byte_chunk_size: 300,
            text_sample_bytes: 64,
            read_buffer_bytes: 16,
        }
    }

    fn plan(strategy: SplitStrategy, estimated_chunks: usize, unit: u64) -> SplitPlan {
        SplitPlan {
            strategy,
            estimated_chunks,
            chunk_unit_size: unit,
            reason: SplitReason::OversizedBytes,
        }
    }

    fn area(temp_dir: &TempDir) -> PathBuf {
        let dir = temp_dir.path().join("split_test");
        fs::create_dir(&dir).unwrap();
        dir
    }

    #[test]
    fn test_part_file_name() {
        assert_eq!(part_file_name("report", 2, 11, "pdf"), "report_part2of11.pdf");
        assert_eq!(part_file_name("README", 1, 3, ""), "README_part1of3");
    }

    #[test]
    fn test_paginated_split_reuses_loaded_document() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("scan.pdf");
        build_pdf(&source, 15);
        let loaded = lopdf::Document::load(&source).unwrap();
        fs::remove_file(&source).unwrap();
        let dir = area(&temp_dir);

        let writer = PartWriter::new(small_config());
        let parts = writer
            .write_loaded(&source, Some(loaded), "scan.pdf", &plan(SplitStrategy::PaginatedBinary, 2, 10), &dir)
            .unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(page_count(&parts[0].path), 10);
        assert_eq!(page_count(&parts[1].path), 5);
    }

    #[test]
    fn test_paginated_split_101_pages() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("book.pdf");
        build_pdf(&source, 101);
        let dir = area(&temp_dir);

        let writer = PartWriter::new(small_config());
        let parts = writer
            .write(&source, "book.pdf", &plan(SplitStrategy::PaginatedBinary, 11, 10), &dir)
            .unwrap();

        assert_eq!(parts.len(), 11);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.sequence_index, i as u32 + 1);
            assert_eq!(part.total_parts, 11);
            let expected_pages = if i == 10 { 1 } else { 10 };
            assert_eq!(page_count(&part.path), expected_pages);
        }
        assert!(parts[0].path.ends_with("book_part1of11.pdf"));
        assert!(parts[10].path.ends_with("book_part11of11.pdf"));
    }

    #[test]
    fn test_text_split_renames_to_actual_count() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("notes.txt");
        // 250 chars of 2 bytes each, read 16 bytes at a time
        let text = "ž".repeat(250);
        fs::write(&source, &text).unwrap();
        let dir = area(&temp_dir);

        let writer = PartWriter::new(small_config());
        let parts = writer
            .write(&source, "notes.txt", &plan(SplitStrategy::DelimitedText, 4, 100), &dir)
            .unwrap();

        assert_eq!(parts.len(), 3);
        let names: Vec<String> = parts
            .iter()
            .map(|p| p.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["notes_part1of3.txt", "notes_part2of3.txt", "notes_part3of3.txt"]);
        assert!(!dir.join("notes_part4of3.txt").exists());

        let mut on_disk: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        on_disk.sort();
        assert_eq!(on_disk, names);

        let rebuilt: String = parts.iter().map(|p| fs::read_to_string(&p.path).unwrap()).collect();
        assert_eq!(rebuilt, text);
        assert_eq!(fs::read_to_string(&parts[0].path).unwrap().chars().count(), 100);
        assert_eq!(fs::read_to_string(&parts[2].path).unwrap().chars().count(), 50);
    }

    #[test]
    fn test_opaque_split_preserves_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("archive.zip");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &data).unwrap();
        let dir = area(&temp_dir);

        let writer = PartWriter::new(small_config());
        let parts = writer
            .write(&source, "archive.zip", &plan(SplitStrategy::OpaqueBinary, 4, 300), &dir)
            .unwrap();

        let sizes: Vec<u64> = parts.iter().map(|p| p.byte_size).collect();
        assert_eq!(sizes, vec![300, 300, 300, 100]);
        assert_eq!(sizes.iter().sum::<u64>(), data.len() as u64);

        let rebuilt: Vec<u8> = parts.iter().flat_map(|p| fs::read(&p.path).unwrap()).collect();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_decode_replaces_invalid_and_carries_incomplete() {
        let mut out = String::new();
        assert_eq!(decode_utf8(&[b'a', 0xFF, b'b'], false, &mut out), 3);
        assert_eq!(out, "a\u{FFFD}b");

        // First byte of a two-byte sequence
        let mut out = String::new();
        assert_eq!(decode_utf8(&[b'x', 0xC5], false, &mut out), 1);
        assert_eq!(out, "x");

        let mut out = String::new();
        assert_eq!(decode_utf8(&[0xC5], true, &mut out), 1);
        assert_eq!(out, "\u{FFFD}");
    }

    #[test]
    fn test_missing_source_is_write_error() {
        let temp_dir = TempDir::new().unwrap();
        let dir = area(&temp_dir);
        let writer = PartWriter::new(small_config());
        let result = writer.write(
            &temp_dir.path().join("gone.bin"),
            "gone.bin",
            &plan(SplitStrategy::OpaqueBinary, 2, 300),
            &dir,
        );
        assert!(matches!(result, Err(DocsplitError::Write(_))));
    }
}
