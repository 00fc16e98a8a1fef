use serde::Serialize;

use super::classifier::{SplitReason, SplitVerdict};
use crate::config::SplittingConfig;
use crate::format::FormatClass;

/// How a file is divided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    PaginatedBinary,
    DelimitedText,
    OpaqueBinary,
}

/// Strategy and chunk-count decision for one document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitPlan {
    pub strategy: SplitStrategy,
    /// Exact for paginated and opaque strategies, an estimate for text
    pub estimated_chunks: usize,
    /// Pages, characters or bytes per part depending on the strategy
    pub chunk_unit_size: u64,
    pub reason: SplitReason,
}

fn div_ceil(total: u64, unit: u64) -> usize {
    if total == 0 {
        return 0;
    }
    ((total + unit - 1) / unit) as usize
}

/// Turn a "must split" verdict into a plan. Returns None for "keep whole".
///
/// A paginated file whose page count is unknown (conservative split) is cut
/// on byte boundaries instead. So is a byte-oversized file whose pages or
/// characters fit in a single part: it never leaves in one piece.
pub fn plan_split(
    format: FormatClass,
    byte_size: u64,
    verdict: &SplitVerdict,
    config: &SplittingConfig,
) -> Option<SplitPlan> {
    let reason = match (verdict.should_split, verdict.reason) {
        (true, Some(reason)) => reason,
        _ => return None,
    };

    let opaque = || SplitPlan {
        strategy: SplitStrategy::OpaqueBinary,
        estimated_chunks: div_ceil(byte_size, config.byte_chunk_size),
        chunk_unit_size: config.byte_chunk_size,
        reason,
    };

    let plan = match format {
        FormatClass::PaginatedBinary => match verdict.page_count {
            Some(pages) => SplitPlan {
                strategy: SplitStrategy::PaginatedBinary,
                estimated_chunks: div_ceil(pages as u64, config.page_chunk_size as u64),
                chunk_unit_size: config.page_chunk_size as u64,
                reason,
            },
            None => opaque(),
        },
        FormatClass::DelimitedText => {
            let chars = verdict.estimated_chars.unwrap_or(byte_size);
            SplitPlan {
                strategy: SplitStrategy::DelimitedText,
                estimated_chunks: div_ceil(chars, config.char_chunk_size as u64),
                chunk_unit_size: config.char_chunk_size as u64,
                reason,
            }
        }
        FormatClass::OpaqueBinary | FormatClass::Unclassified => opaque(),
    };

    if reason == SplitReason::OversizedBytes && plan.estimated_chunks < 2 {
        return Some(opaque());
    }
    Some(plan)
}
