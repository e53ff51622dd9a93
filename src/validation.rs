//! Frame validation utilities.
//!
//! MJPEG drivers hand over whatever the ISP produced. These checks catch a
//! buffer that is empty, still zeroed, or cut short before it is persisted.

/// Start-of-image marker.
const SOI: [u8; 2] = [0xFF, 0xD8];
/// End-of-image marker.
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Why a frame is not a complete JPEG image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JpegIssue {
    /// No bytes at all.
    #[error("frame is empty")]
    Empty,
    /// The frame does not begin with `FF D8`.
    #[error("missing start-of-image marker")]
    MissingStart,
    /// No `FF D9` follows the start marker.
    #[error("missing end-of-image marker")]
    MissingEnd,
}

/// Validates that `data` holds a JPEG image from SOI through EOI.
///
/// Trailing bytes after EOI are tolerated; drivers commonly report the
/// whole buffer as used.
pub fn validate_jpeg(data: &[u8]) -> Result<(), JpegIssue> {
    if data.is_empty() {
        return Err(JpegIssue::Empty);
    }
    if !data.starts_with(&SOI) {
        return Err(JpegIssue::MissingStart);
    }
    if jpeg_end(data).is_none() {
        return Err(JpegIssue::MissingEnd);
    }
    Ok(())
}

/// Length of the image up to and including the last EOI marker.
pub fn jpeg_end(data: &[u8]) -> Option<usize> {
    data.windows(2)
        .skip(SOI.len())
        .rposition(|pair| pair == EOI)
        .map(|pos| pos + SOI.len() + EOI.len())
}
