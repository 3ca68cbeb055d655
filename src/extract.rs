//! Text extraction for uploaded files.
//!
//! Plain-text family files are decoded as UTF-8; PDFs go through
//! `pdf-extract`. Anything else (including image and audio formats, whose
//! OCR/transcription engines live outside this service) is intentionally
//! not indexable and reported as skipped, which is terminal for the file.

use crate::error::{HarnessError, Result};

#[derive(Debug)]
pub struct ExtractedText {
    pub content: String,
    pub content_type: String,
}

/// File extensions the upload path accepts, with their MIME types.
pub const SUPPORTED_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("markdown", "text/markdown"),
    ("csv", "text/csv"),
    ("log", "text/plain"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("html", "text/html"),
    ("pdf", "application/pdf"),
];

pub fn is_supported(extension: &str) -> bool {
    let lowered = extension.to_lowercase();
    SUPPORTED_TYPES.iter().any(|(ext, _)| *ext == lowered)
}

pub fn extension_of(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .filter(|ext| *ext != filename)
        .unwrap_or_default()
        .to_lowercase()
}

/// Extract indexable text from raw file bytes.
pub fn extract_text(filename: &str, bytes: &[u8]) -> Result<ExtractedText> {
    let ext = extension_of(filename);
    let Some((_, mime)) = SUPPORTED_TYPES.iter().find(|(e, _)| *e == ext) else {
        return Err(HarnessError::DocumentSkipped(format!(
            "unsupported file type: .{ext}"
        )));
    };

    let content = if ext == "pdf" {
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| {
            HarnessError::DocumentSkipped(format!("PDF text extraction failed: {e}"))
        })?
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };

    if content.trim().is_empty() {
        return Err(HarnessError::DocumentSkipped(
            "file contains no indexable text".to_string(),
        ));
    }

    Ok(ExtractedText {
        content,
        content_type: mime.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_extraction() {
        let extracted = extract_text("notes.txt", b"hello world").unwrap();
        assert_eq!(extracted.content, "hello world");
        assert_eq!(extracted.content_type, "text/plain");
    }

    #[test]
    fn test_markdown_mime() {
        let extracted = extract_text("README.md", b"# title").unwrap();
        assert_eq!(extracted.content_type, "text/markdown");
    }

    #[test]
    fn test_unsupported_extension_is_skip() {
        let err = extract_text("track.mp3", b"\x00\x01").unwrap_err();
        assert!(matches!(err, HarnessError::DocumentSkipped(_)));
    }

    #[test]
    fn test_empty_content_is_skip() {
        let err = extract_text("empty.txt", b"   \n  ").unwrap_err();
        assert!(matches!(err, HarnessError::DocumentSkipped(_)));
    }

    #[test]
    fn test_extension_parsing() {
        assert_eq!(extension_of("a.PDF"), "pdf");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("no_extension"), "");
        assert!(is_supported("Md"));
        assert!(!is_supported("exe"));
    }
}
