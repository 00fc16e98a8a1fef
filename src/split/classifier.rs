use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::SplittingConfig;
use crate::error::{DocsplitError, Result};
use crate::format::FormatClass;

/// Why a file has to be split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitReason {
    OversizedBytes,
    OversizedPages,
    OversizedEstimatedCharacters,
    /// Page metadata was unreadable and the file is large; split on bytes
    IntrospectionFailedConservativeSplit,
}

impl SplitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitReason::OversizedBytes => "oversized-bytes",
            SplitReason::OversizedPages => "oversized-pages",
            SplitReason::OversizedEstimatedCharacters => "oversized-estimated-characters",
            SplitReason::IntrospectionFailedConservativeSplit => "introspection-failed-conservative-split",
        }
    }
}

impl fmt::Display for SplitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier decision plus whatever the probes learned along the way
#[derive(Debug, Clone, PartialEq)]
pub struct SplitVerdict {
    pub should_split: bool,
    pub reason: Option<SplitReason>,
    /// Page count of a paginated file, when it could be read
    pub page_count: Option<usize>,
    /// Extrapolated character count of a text file
    pub estimated_chars: Option<u64>,
    /// Probe failure that did not lead to a split
    pub warning: Option<String>,
}

impl SplitVerdict {
    fn keep_whole() -> Self {
        Self {
            should_split: false,
            reason: None,
            page_count: None,
            estimated_chars: None,
            warning: None,
        }
    }

    fn split(reason: SplitReason) -> Self {
        Self {
            should_split: true,
            reason: Some(reason),
            ..Self::keep_whole()
        }
    }

    /// Human-readable explanation, mirrored into logs
    pub fn describe(&self) -> String {
        match (self.reason, &self.warning) {
            (Some(reason), _) => reason.as_str().to_string(),
            (None, Some(warning)) => format!("no split needed ({})", warning),
            (None, None) => "no split needed".to_string(),
        }
    }
}

/// Decides whether a file must be split, per format class.
#[derive(Debug, Clone)]
pub struct SizeClassifier {
    config: SplittingConfig,
}

impl SizeClassifier {
    pub fn new(config: SplittingConfig) -> Self {
        Self { config }
    }

    /// Classify a file, probing its pages or sampling its text as needed.
    ///
    /// Fails with `Introspection` only when the file itself cannot be read;
    /// a corrupt page tree degrades to the conservative rule or a warning.
    pub fn classify(&self, path: &Path, format: FormatClass, byte_size: u64) -> Result<SplitVerdict> {
        self.classify_and_load(path, format, byte_size).map(|(verdict, _)| verdict)
    }

    /// Same as `classify`, also returning the parsed PDF of a paginated file
    /// so the writer can split it without loading it again.
    pub fn classify_and_load(
        &self,
        path: &Path,
        format: FormatClass,
        byte_size: u64,
    ) -> Result<(SplitVerdict, Option<lopdf::Document>)> {
        std::fs::metadata(path).map_err(|e| {
            DocsplitError::Introspection(format!("cannot stat {}: {}", path.display(), e))
        })?;

        let (page_probe, loaded) = match format {
            FormatClass::PaginatedBinary => match lopdf::Document::load(path) {
                Ok(document) => (Some(Ok(document.get_pages().len())), Some(document)),
                Err(e) => (Some(Err(e.to_string())), None),
            },
            _ => (None, None),
        };
        let verdict = self.classify_with_probe(path, format, byte_size, page_probe)?;
        Ok((verdict, loaded))
    }

    /// Classify with a page-count probe gathered by the caller.
    pub fn classify_with_probe(
        &self,
        path: &Path,
        format: FormatClass,
        byte_size: u64,
        page_probe: Option<std::result::Result<usize, String>>,
    ) -> Result<SplitVerdict> {
        let max = self.config.max_file_size_bytes;
        let half_max = max / 2;

        let mut verdict = if byte_size > max {
            SplitVerdict::split(SplitReason::OversizedBytes)
        } else {
            SplitVerdict::keep_whole()
        };

        match format {
            FormatClass::PaginatedBinary => match page_probe {
                Some(Ok(pages)) => {
                    verdict.page_count = Some(pages);
                    if !verdict.should_split && pages > self.config.page_chunk_size {
                        verdict = SplitVerdict {
                            page_count: Some(pages),
                            ..SplitVerdict::split(SplitReason::OversizedPages)
                        };
                    }
                }
                Some(Err(probe_error)) => {
                    if !verdict.should_split {
                        if byte_size > half_max {
                            verdict = SplitVerdict::split(SplitReason::IntrospectionFailedConservativeSplit);
                        } else {
                            log::warn!(
                                "Cannot read page count of {}: {} (keeping whole)",
                                path.display(),
                                probe_error
                            );
                            verdict.warning = Some(format!("page count unreadable: {}", probe_error));
                        }
                    }
                }
                None => {}
            },
            FormatClass::DelimitedText => {
                // Estimate feeds the planner even when rule 1 already fired.
                if byte_size > half_max {
                    let estimated = estimate_char_count(path, byte_size, self.config.text_sample_bytes)?;
                    verdict.estimated_chars = Some(estimated);
                    if !verdict.should_split && estimated > self.config.char_chunk_size as u64 {
                        verdict = SplitVerdict {
                            estimated_chars: Some(estimated),
                            ..SplitVerdict::split(SplitReason::OversizedEstimatedCharacters)
                        };
                    }
                }
            }
            FormatClass::OpaqueBinary | FormatClass::Unclassified => {}
        }

        Ok(verdict)
    }
}

/// Extrapolate the character count of a text file from a bounded prefix.
pub fn estimate_char_count(path: &Path, byte_size: u64, sample_bytes: usize) -> Result<u64> {
    let file = File::open(path).map_err(|e| {
        DocsplitError::Introspection(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut sample = Vec::with_capacity(sample_bytes.min(byte_size as usize));
    file.take(sample_bytes as u64)
        .read_to_end(&mut sample)
        .map_err(|e| DocsplitError::Introspection(format!("cannot read {}: {}", path.display(), e)))?;

    if sample.is_empty() {
        return Ok(0);
    }
    let sample_chars = String::from_utf8_lossy(&sample).chars().count() as u64;
    if sample.len() as u64 >= byte_size {
        return Ok(sample_chars);
    }
    Ok(sample_chars * byte_size / sample.len() as u64)
}
