//! Persistence Codec
//!
//! Two formats:
//!
//! - **Text** (all layers): one token per line. Weight bits as `1`/`0` in
//!   linear order, then (threshold layers only) one signed integer per output
//!   unit. Loading reads exactly the expected number of tokens and leaves
//!   anything after them in the stream, so several layers can share one file.
//! - **Binary** (convolution weights): one little-endian `u64` per weight in
//!   `(oc, ic, ky, kx)` order. Only the value `1` decodes to `true`.
//!
//! Loads parse into fresh buffers; callers commit them only after the whole
//! read succeeded.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::debug;

use crate::bits::BitVector;
use crate::error::{BnnError, Result};

/// Width of one binary weight entry in bytes
pub const BINARY_ENTRY_BYTES: usize = core::mem::size_of::<u64>();

// ============================================================================
// Text format
// ============================================================================

/// Whitespace-separated token reader that never reads past the current token
pub struct TokenReader<R> {
    inner: R,
    token: Vec<u8>,
}

impl<R: BufRead> TokenReader<R> {
    /// Wrap a buffered reader
    pub fn new(inner: R) -> Self {
        Self { inner, token: Vec::with_capacity(16) }
    }

    /// Next token, or `None` at end of stream
    pub fn next_token(&mut self) -> Result<Option<&str>> {
        self.token.clear();

        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let len = buf.len();
            let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
            self.inner.consume(skip);
            if skip < len {
                break;
            }
        }

        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let len = buf.len();
            let take = buf.iter().take_while(|b| !b.is_ascii_whitespace()).count();
            self.token.extend_from_slice(&buf[..take]);
            self.inner.consume(take);
            if take < len {
                break;
            }
        }

        if self.token.is_empty() {
            return Ok(None);
        }
        core::str::from_utf8(&self.token)
            .map(Some)
            .map_err(|_| BnnError::malformed("text parameters", "token is not valid UTF-8"))
    }
}

/// Write bits one per line as `1`/`0`
pub fn write_bits_text<W, I>(writer: &mut W, bits: I) -> Result<()>
where
    W: Write + ?Sized,
    I: IntoIterator<Item = bool>,
{
    for bit in bits {
        writer.write_all(if bit { b"1\n" } else { b"0\n" })?;
    }
    Ok(())
}

/// Write thresholds one per line
pub fn write_thresholds_text<W: Write + ?Sized>(writer: &mut W, thresholds: &[i64]) -> Result<()> {
    for t in thresholds {
        writeln!(writer, "{}", t)?;
    }
    Ok(())
}

/// Read exactly `count` weight bits
///
/// # Errors
/// [`BnnError::Malformed`] if the stream ends early or a token is not `0`/`1`.
pub fn read_bits_text<R: BufRead>(tokens: &mut TokenReader<R>, count: usize) -> Result<Vec<bool>> {
    let mut bits = Vec::with_capacity(count);
    for n in 0..count {
        let bit = match tokens.next_token()? {
            Some("1") => true,
            Some("0") => false,
            Some(other) => {
                return Err(BnnError::malformed(
                    "weight bits",
                    format!("token {} is {:?}, expected 0 or 1", n, other),
                ))
            }
            None => {
                return Err(BnnError::malformed(
                    "weight bits",
                    format!("expected {} tokens, stream ended after {}", count, n),
                ))
            }
        };
        bits.push(bit);
    }
    Ok(bits)
}

/// Read exactly `count` integer thresholds
pub fn read_thresholds_text<R: BufRead>(tokens: &mut TokenReader<R>, count: usize) -> Result<Vec<i64>> {
    let mut thresholds = Vec::with_capacity(count);
    for n in 0..count {
        let token = tokens.next_token()?.ok_or_else(|| {
            BnnError::malformed(
                "thresholds",
                format!("expected {} tokens, stream ended after {}", count, n),
            )
        })?;
        let value = token.parse::<i64>().map_err(|e| {
            BnnError::malformed("thresholds", format!("token {} ({:?}): {}", n, token, e))
        })?;
        thresholds.push(value);
    }
    Ok(thresholds)
}

// ============================================================================
// Binary format
// ============================================================================

/// Decode one stored entry: only exactly `1` is a set bit
#[inline(always)]
pub const fn decode_binary_entry(entry: u64) -> bool {
    entry == 1
}

/// Read `count` fixed-width entries from a stream
pub fn read_binary_weights<R: Read + ?Sized>(reader: &mut R, count: usize) -> Result<BitVector> {
    let mut bits = BitVector::new(count);
    let mut entry = [0u8; BINARY_ENTRY_BYTES];
    for i in 0..count {
        reader.read_exact(&mut entry).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => BnnError::malformed(
                "binary weights",
                format!(
                    "expected {} bytes, stream ended within entry {}",
                    count * BINARY_ENTRY_BYTES,
                    i
                ),
            ),
            _ => BnnError::Io(e),
        })?;
        if decode_binary_entry(u64::from_le_bytes(entry)) {
            bits.set(i, true);
        }
    }
    Ok(bits)
}

/// Write bits as fixed-width `1`/`0` entries
pub fn write_binary_weights<W: Write + ?Sized>(writer: &mut W, bits: &BitVector) -> Result<()> {
    for bit in bits.iter() {
        writer.write_all(&(bit as u64).to_le_bytes())?;
    }
    Ok(())
}

/// Load `count` binary weights from a file
///
/// The file must hold exactly `count` entries.
///
/// # Errors
/// [`BnnError::ResourceUnavailable`] if the file cannot be opened,
/// [`BnnError::Malformed`] if it is shorter or longer than expected.
pub fn load_binary_weights<P: AsRef<Path>>(path: P, count: usize) -> Result<BitVector> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| BnnError::ResourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let bits = read_binary_weights(&mut reader, count)?;

    let mut probe = [0u8; 1];
    if reader.read(&mut probe)? != 0 {
        return Err(BnnError::malformed(
            "binary weights",
            format!("{} holds more than {} entries", path.display(), count),
        ));
    }

    debug!(
        "loaded {} binary weights ({} set) from {}",
        count,
        bits.count_ones(),
        path.display()
    );
    Ok(bits)
}

/// Save binary weights to a file
pub fn save_binary_weights<P: AsRef<Path>>(path: P, bits: &BitVector) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| BnnError::ResourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    write_binary_weights(&mut writer, bits)?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_token_reader_stops_at_token() {
        let mut tokens = TokenReader::new(Cursor::new("  1\n0\n\n-7 rest"));
        assert_eq!(tokens.next_token().unwrap(), Some("1"));
        assert_eq!(tokens.next_token().unwrap(), Some("0"));
        assert_eq!(tokens.next_token().unwrap(), Some("-7"));
        assert_eq!(tokens.next_token().unwrap(), Some("rest"));
        assert_eq!(tokens.next_token().unwrap(), None);
    }

    #[test]
    fn test_token_reader_small_buffer() {
        // tokens straddling BufReader refills
        let inner = BufReader::with_capacity(2, Cursor::new("101 22\n333"));
        let mut tokens = TokenReader::new(inner);
        assert_eq!(tokens.next_token().unwrap(), Some("101"));
        assert_eq!(tokens.next_token().unwrap(), Some("22"));
        assert_eq!(tokens.next_token().unwrap(), Some("333"));
        assert_eq!(tokens.next_token().unwrap(), None);
    }

    #[test]
    fn test_text_bits_roundtrip_layout() {
        let mut buf = Vec::new();
        write_bits_text(&mut buf, [true, false, true]).unwrap();
        write_thresholds_text(&mut buf, &[3, -2]).unwrap();
        assert_eq!(String::from_utf8(buf.clone()).unwrap(), "1\n0\n1\n3\n-2\n");

        let mut tokens = TokenReader::new(Cursor::new(buf));
        assert_eq!(read_bits_text(&mut tokens, 3).unwrap(), vec![true, false, true]);
        assert_eq!(read_thresholds_text(&mut tokens, 2).unwrap(), vec![3, -2]);
    }

    #[test]
    fn test_text_rejects_short_stream() {
        let mut tokens = TokenReader::new(Cursor::new("1\n0\n"));
        let err = read_bits_text(&mut tokens, 3).unwrap_err();
        assert!(matches!(err, BnnError::Malformed { context: "weight bits", .. }), "got {:?}", err);
    }

    #[test]
    fn test_text_rejects_bad_bit_token() {
        let mut tokens = TokenReader::new(Cursor::new("1\n2\n"));
        assert!(read_bits_text(&mut tokens, 2).is_err());

        let mut tokens = TokenReader::new(Cursor::new("x\n"));
        assert!(read_thresholds_text(&mut tokens, 1).is_err());
    }

    #[test]
    fn test_binary_entry_decoding() {
        assert!(decode_binary_entry(1));
        assert!(!decode_binary_entry(0));
        assert!(!decode_binary_entry(2));
        assert!(!decode_binary_entry(u64::MAX));
        assert!(!decode_binary_entry(1 << 32));
    }

    #[test]
    fn test_binary_stream_decoding() {
        let mut bytes = Vec::new();
        for v in [1u64, 0, 2, 1, 0xFF] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let bits = read_binary_weights(&mut Cursor::new(bytes), 5).unwrap();
        assert_eq!(bits.to_bools(), vec![true, false, false, true, false]);
    }

    #[test]
    fn test_binary_truncated_stream() {
        let bytes = vec![1u8, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0];
        let err = read_binary_weights(&mut Cursor::new(bytes), 2).unwrap_err();
        assert!(matches!(err, BnnError::Malformed { .. }), "got {:?}", err);
    }

    #[test]
    fn test_missing_file_is_resource_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_binary_weights(dir.path().join("missing.bin"), 4).unwrap_err();
        assert!(matches!(err, BnnError::ResourceUnavailable { .. }), "got {:?}", err);
    }

    #[test]
    fn test_binary_file_roundtrip_and_length_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.bin");
        let bits = BitVector::from_bools(&[true, false, true, true]);

        save_binary_weights(&path, &bits).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 32);
        assert_eq!(load_binary_weights(&path, 4).unwrap(), bits);

        assert!(load_binary_weights(&path, 5).is_err(), "file too short");
        assert!(load_binary_weights(&path, 3).is_err(), "file too long");
    }
}
