// ppm.rs — Binary pixel-map (PPM "P6") codec.
//
// RESPONSIBILITIES
// ─────────────────
// 1. `decode` — parse the ASCII/binary hybrid format: a whitespace-separated
//    header (magic, width, height, maxval, with `#` comments between
//    tokens), one separator byte, then width*height raw RGB triplets.
//
// 2. `encode` — emit the same format, always at 8-bit depth (maxval 255).
//
// HEADER TOKENIZER
// ─────────────────
// The header is loosely specified: any run of spaces/newlines separates
// tokens, and a `#` at the start of a token discards the rest of that line.
// A `#` in the middle of a token is part of the token. The same tokenizer
// is reused for every header field.
//
// DEPTH NORMALIZATION
// ────────────────────
// For maxval != 255 every channel is multiplied by the truncating integer
// quotient 255 / maxval. This is deliberately NOT the idealized rescale
// (channel * 255.0 / maxval, rounded): the truncation error for maxval
// values that do not divide 255 is part of the output contract, and a
// decoder that "fixes" it produces different bytes. A maxval above 255
// truncates the quotient to 0 and decodes every channel as 0.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::image::{Image, Pixel};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from pixel-map decode/encode. Never recovered locally — every
/// failure aborts the call and propagates to the caller.
#[derive(Debug, Error)]
pub enum PpmError {
    /// File missing, unreadable, unwritable, or pixel body shorter than
    /// the header promised.
    #[error("pixel-map I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Unsupported magic number or malformed header token.
    #[error("malformed pixel-map header in {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
}

fn io_error(path: &Path, source: io::Error) -> PpmError {
    PpmError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn format_error(path: &Path, reason: impl Into<String>) -> PpmError {
    PpmError::Format {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Header tokenizer
// ---------------------------------------------------------------------------

/// Cursor over the raw file bytes for header tokenization.
///
/// Working on bytes rather than a text stream means the position after the
/// last header token is an exact byte offset into the file — the binary
/// body starts one separator byte later, with no text-mode translation in
/// between.
struct HeaderCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> HeaderCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        HeaderCursor { bytes, pos: 0 }
    }

    /// Byte offset of the cursor. After `next_token` returns, this points
    /// at the whitespace byte that terminated the token (or end-of-stream).
    fn pos(&self) -> usize {
        self.pos
    }

    /// Produce the next header token, or `None` at end-of-stream.
    ///
    /// Skips runs of space/newline, then accumulates until whitespace or
    /// end-of-stream. A token that *begins* with `#` is a comment: it is
    /// discarded up to and including the next newline and tokenizing
    /// resumes. A `#` mid-token is ordinary token content.
    fn next_token(&mut self) -> Option<String> {
        loop {
            while self.pos < self.bytes.len()
                && matches!(self.bytes[self.pos], b' ' | b'\n')
            {
                self.pos += 1;
            }
            if self.pos >= self.bytes.len() {
                return None;
            }

            if self.bytes[self.pos] == b'#' {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                if self.pos < self.bytes.len() {
                    self.pos += 1; // consume the newline ending the comment
                }
                continue;
            }

            let start = self.pos;
            while self.pos < self.bytes.len()
                && !matches!(self.bytes[self.pos], b' ' | b'\n')
            {
                self.pos += 1;
            }
            return Some(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned());
        }
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Channel multiplier for a given maxval: the truncating integer quotient
/// 255 / maxval, or 1 for files already at 8-bit depth.
fn depth_scale(maxval: u32) -> u16 {
    if maxval == 255 {
        1
    } else {
        (255 / maxval) as u16
    }
}

fn parse_header_int(
    path: &Path,
    cursor: &mut HeaderCursor<'_>,
    field: &str,
) -> Result<u32, PpmError> {
    let token = cursor
        .next_token()
        .ok_or_else(|| format_error(path, format!("header ended before {field} token")))?;
    token
        .parse::<u32>()
        .map_err(|_| format_error(path, format!("{field} token {token:?} is not a non-negative integer")))
}

/// Decode a binary RGB pixel-map file into an [`Image`].
///
/// Only the binary RGB variant (magic "P6") is accepted. Channels are
/// normalized to 8-bit depth via the truncating quotient described in the
/// module docs.
///
/// # Errors
/// [`PpmError::Io`] when the file cannot be read or the pixel body is
/// shorter than `width * height * 3` bytes; [`PpmError::Format`] for an
/// unsupported magic number or a malformed/zero header field.
pub fn decode<P: AsRef<Path>>(path: P) -> Result<Image, PpmError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| io_error(path, e))?;

    let mut cursor = HeaderCursor::new(&bytes);

    let magic = cursor
        .next_token()
        .ok_or_else(|| format_error(path, "header ended before magic number token"))?;
    // The first two characters of the magic token identify the variant.
    if !magic.starts_with("P6") {
        return Err(format_error(
            path,
            format!("unsupported magic number {magic:?} (only binary RGB \"P6\" is supported)"),
        ));
    }

    let width = parse_header_int(path, &mut cursor, "width")?;
    let height = parse_header_int(path, &mut cursor, "height")?;
    let maxval = parse_header_int(path, &mut cursor, "maxval")?;

    if width == 0 || height == 0 {
        return Err(format_error(
            path,
            format!("image dimensions must be strictly positive (got {width}×{height})"),
        ));
    }
    if maxval == 0 {
        return Err(format_error(path, "maxval must be strictly positive"));
    }

    debug!(width, height, maxval, "parsed pixel-map header");

    // Exactly one separator byte sits between the maxval token and the
    // binary body. The cursor stopped on that separator, so the body
    // starts one byte past it.
    let body_start = cursor.pos() + 1;
    let body = bytes.get(body_start..).unwrap_or(&[]);

    // u128 so width * height * 3 cannot overflow before the length check.
    let needed = width as u128 * height as u128 * 3;
    if (body.len() as u128) < needed {
        return Err(io_error(
            path,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "truncated pixel body: expected {needed} bytes, found {}",
                    body.len()
                ),
            ),
        ));
    }

    let scale = depth_scale(maxval);
    let (width, height) = (width as usize, height as usize);
    let mut data = Vec::with_capacity(width * height);

    // Rows outer, columns inner — row-major, matching the file layout.
    for y in 0..height {
        for x in 0..width {
            let off = (y * width + x) * 3;
            data.push(Pixel::new(
                body[off] as u16 * scale,
                body[off + 1] as u16 * scale,
                body[off + 2] as u16 * scale,
            ));
        }
    }

    Ok(Image::from_vec(width, height, data))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// A channel sample clamped back into 8-bit range for output.
#[inline]
fn clamp8(channel: u16) -> u8 {
    channel.min(255) as u8
}

/// Encode an [`Image`] as a binary RGB pixel-map file.
///
/// The header is always `P6\n{width} {height}\n255\n` — output is
/// normalized to 8-bit depth regardless of the source image's original
/// depth, and channels above 255 are clamped.
///
/// # Errors
/// [`PpmError::Io`] when the destination cannot be created or written.
pub fn encode<P: AsRef<Path>>(image: &Image, path: P) -> Result<(), PpmError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| io_error(path, e))?;
    let mut out = BufWriter::new(file);

    write!(out, "P6\n{} {}\n255\n", image.width(), image.height())
        .map_err(|e| io_error(path, e))?;

    for y in 0..image.height() {
        for x in 0..image.width() {
            let p = image.get(x, y);
            out.write_all(&[clamp8(p.r), clamp8(p.g), clamp8(p.b)])
                .map_err(|e| io_error(path, e))?;
        }
    }

    out.flush().map_err(|e| io_error(path, e))?;
    debug!(width = image.width(), height = image.height(), "encoded pixel-map");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
