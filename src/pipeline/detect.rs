//! Content-kind detection.
//!
//! Signature bytes win; the filename extension is consulted only when no
//! known signature matches.

use std::path::Path;

use crate::batch::ContentKind;
use crate::pipeline::dicom::has_part10_prefix;

const JPEG_SIGNATURE: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_SIGNATURE: &[u8] = b"\x89PNG";
const GIF_SIGNATURE: &[u8] = b"GIF";
const BMP_SIGNATURE: &[u8] = b"BM";

/// Detects the content kind of `bytes`, falling back to `filename`'s extension.
pub fn detect_kind(bytes: &[u8], filename: &str) -> ContentKind {
    if let Some(kind) = detect_signature(bytes) {
        return kind;
    }

    match extension(filename).as_deref() {
        Some("dcm") | Some("dicom") => ContentKind::Dicom,
        _ => ContentKind::Image,
    }
}

/// Detects a content kind from signature bytes only.
pub fn detect_signature(bytes: &[u8]) -> Option<ContentKind> {
    if has_part10_prefix(bytes) {
        Some(ContentKind::Dicom)
    } else if bytes.starts_with(JPEG_SIGNATURE) {
        Some(ContentKind::Jpeg)
    } else if bytes.starts_with(PNG_SIGNATURE) {
        Some(ContentKind::Png)
    } else if bytes.starts_with(GIF_SIGNATURE) {
        Some(ContentKind::Gif)
    } else if bytes.starts_with(BMP_SIGNATURE) {
        Some(ContentKind::Bmp)
    } else {
        None
    }
}

/// Returns the lowercase extension of `filename`, without the dot.
pub fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
