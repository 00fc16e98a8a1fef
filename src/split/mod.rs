//! Deciding whether a file must be split, planning the split and writing parts.

pub mod classifier;
pub mod planner;
pub mod working_area;
pub mod writer;

pub use classifier::{SizeClassifier, SplitReason, SplitVerdict};
pub use planner::{plan_split, SplitPlan, SplitStrategy};
pub use working_area::{WorkingArea, WorkingAreaManager, WORKING_AREA_PREFIX};
pub use writer::{part_file_name, PartWriter, WrittenPart};

#[cfg(test)]
pub(crate) mod test_pdf;
