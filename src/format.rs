//! Format classes, resolved once from the file extension at ingestion.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::DocsplitError;

/// Closed set of format families the splitter knows how to divide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatClass {
    /// Page-structured binary documents (PDF)
    PaginatedBinary,
    /// Character streams: plain text, markup, CSV, JSON
    DelimitedText,
    /// Binary containers split on byte boundaries
    OpaqueBinary,
    Unclassified,
}

impl FormatClass {
    /// Resolve from an extension, case-insensitive, with or without the leading dot.
    pub fn from_extension(extension: &str) -> Self {
        let ext = extension.trim_start_matches('.').to_lowercase();
        match ext.as_str() {
            "pdf" => FormatClass::PaginatedBinary,
            "txt" | "html" | "htm" | "json" | "csv" | "tsv" | "md" | "xml" | "log" => {
                FormatClass::DelimitedText
            }
            "docx" | "doc" | "xlsx" | "xls" | "odt" | "zip" | "bin" | "jpg" | "jpeg" | "png"
            | "gif" => FormatClass::OpaqueBinary,
            _ => FormatClass::Unclassified,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(FormatClass::Unclassified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatClass::PaginatedBinary => "paginated_binary",
            FormatClass::DelimitedText => "delimited_text",
            FormatClass::OpaqueBinary => "opaque_binary",
            FormatClass::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for FormatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatClass {
    type Err = DocsplitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paginated_binary" => Ok(FormatClass::PaginatedBinary),
            "delimited_text" => Ok(FormatClass::DelimitedText),
            "opaque_binary" => Ok(FormatClass::OpaqueBinary),
            "unclassified" => Ok(FormatClass::Unclassified),
            other => Err(DocsplitError::InvalidInput(format!("Unknown format class: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_extension() {
        assert_eq!(FormatClass::from_extension("pdf"), FormatClass::PaginatedBinary);
        assert_eq!(FormatClass::from_extension(".PDF"), FormatClass::PaginatedBinary);
        assert_eq!(FormatClass::from_extension("csv"), FormatClass::DelimitedText);
        assert_eq!(FormatClass::from_extension("Json"), FormatClass::DelimitedText);
        assert_eq!(FormatClass::from_extension("docx"), FormatClass::OpaqueBinary);
        assert_eq!(FormatClass::from_extension("xyz"), FormatClass::Unclassified);
        assert_eq!(FormatClass::from_extension(""), FormatClass::Unclassified);
    }

    #[test]
    fn test_from_path() {
        assert_eq!(FormatClass::from_path(Path::new("/a/report.final.pdf")), FormatClass::PaginatedBinary);
        assert_eq!(FormatClass::from_path(Path::new("/a/Makefile")), FormatClass::Unclassified);
    }

    #[test]
    fn test_round_trip_tag() {
        for class in [
            FormatClass::PaginatedBinary,
            FormatClass::DelimitedText,
            FormatClass::OpaqueBinary,
            FormatClass::Unclassified,
        ] {
            assert_eq!(class.as_str().parse::<FormatClass>().unwrap(), class);
        }
        assert!("pdf".parse::<FormatClass>().is_err());
    }
}
