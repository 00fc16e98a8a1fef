//! Document and part state machines.

pub mod tracker;
pub mod reconciler;
pub mod outstanding;

pub use tracker::StatusTracker;
pub use reconciler::{Reconciler, ReconcileOutcome};
pub use outstanding::{CancelFlags, OutstandingParts};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DocsplitError;

/// Status of a top-level document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Splitting,
    Split,
    Completed,
    Error,
    /// Content produced, but the converter reported a problem
    Warning,
    /// Some parts failed; content covers the completed parts only
    Incomplete,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Splitting => "splitting",
            DocumentStatus::Split => "split",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Error => "error",
            DocumentStatus::Warning => "warning",
            DocumentStatus::Incomplete => "incomplete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed
                | DocumentStatus::Error
                | DocumentStatus::Warning
                | DocumentStatus::Incomplete
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// SPLITTING may fall back to PROCESSING when the text writer produced a
    /// single part and the document continues unsplit.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (Pending, Processing | Splitting | Error) => true,
            (Splitting, Split | Processing | Error) => true,
            (Split, Completed | Error | Warning | Incomplete) => true,
            (Processing, Completed | Error | Warning) => true,
            _ => false,
        }
    }
}

/// Status of a single part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl PartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartStatus::Pending => "pending",
            PartStatus::Processing => "processing",
            PartStatus::Completed => "completed",
            PartStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PartStatus::Completed | PartStatus::Error)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// PENDING may go straight to ERROR when cancelled before pickup.
    pub fn can_transition_to(&self, next: PartStatus) -> bool {
        use PartStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Error) | (Processing, Completed) | (Processing, Error)
        )
    }
}

macro_rules! status_text {
    ($ty:ident, [$($variant:ident),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = DocsplitError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $ty::$variant.as_str() {
                        return Ok($ty::$variant);
                    }
                )+
                Err(DocsplitError::InvalidInput(format!(
                    "Unknown {}: {}",
                    stringify!($ty),
                    s
                )))
            }
        }
    };
}

status_text!(DocumentStatus, [Pending, Processing, Splitting, Split, Completed, Error, Warning, Incomplete]);
status_text!(PartStatus, [Pending, Processing, Completed, Error]);
