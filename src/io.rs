//! Low-level byte I/O for the upper layer protocol.
//!
//! The reader keeps an explicit stack of remaining-byte limits,
//! which is how nested TLV structures (PDU → item → sub-item)
//! are decoded without trusting the peer's declared lengths
//! beyond the enclosing structure.

use byteordered::{ByteOrdered, Endianness};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::Read;

/// Length of an application entity title on the wire, in bytes.
pub const AE_TITLE_LENGTH: usize = 16;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("failed to read {} bytes from stream: {}", bytes, source))]
    ReadBytes {
        bytes: u64,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "read of {} bytes would overrun the innermost limit ({} remaining)",
        requested,
        remaining
    ))]
    LimitOverrun {
        requested: u64,
        remaining: u64,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "cannot push limit of {} bytes, only {} admitted by the enclosing limit",
        requested,
        remaining
    ))]
    LimitTooLarge {
        requested: u64,
        remaining: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("no limit was pushed"))]
    NoLimit { backtrace: Backtrace },

    #[snafu(display("text is not valid ISO-646: {}", source))]
    DecodeText {
        source: std::str::Utf8Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A byte stream reader with a configurable byte order
/// and a stack of remaining-byte limits.
///
/// Every read is counted against all limits on the stack.
/// Reading past the innermost limit is an error,
/// reported before any byte is consumed.
#[derive(Debug)]
pub struct DulReader<R> {
    inner: R,
    endianness: Endianness,
    limits: Vec<u64>,
}

impl<R> DulReader<R>
where
    R: Read,
{
    /// Create a new reader over the given byte source.
    pub fn new(inner: R, endianness: Endianness) -> Self {
        DulReader {
            inner,
            endianness,
            limits: Vec::new(),
        }
    }

    /// The current byte order of multi-byte reads.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// The number of bytes admitted by the innermost limit,
    /// or `None` when no limit was pushed.
    pub fn remaining(&self) -> Option<u64> {
        self.limits.last().copied()
    }

    /// Whether the innermost limit has been fully consumed.
    pub fn is_limit_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Constrain subsequent reads to the next `limit` bytes.
    ///
    /// Fails if the enclosing limit admits fewer than `limit` bytes.
    pub fn push_limit(&mut self, limit: u64) -> Result<()> {
        if let Some(&remaining) = self.limits.last() {
            ensure!(
                limit <= remaining,
                LimitTooLargeSnafu {
                    requested: limit,
                    remaining,
                }
            );
        }
        self.limits.push(limit);
        Ok(())
    }

    /// Discard the innermost limit,
    /// skipping over any bytes it still admitted.
    pub fn pop_limit(&mut self) -> Result<()> {
        let remaining = self.remaining().context(NoLimitSnafu)?;
        if remaining > 0 {
            self.skip(remaining)?;
        }
        self.limits.pop();
        Ok(())
    }

    /// Account for `count` bytes about to be read.
    fn advance(&mut self, count: u64) -> Result<()> {
        if let Some(&remaining) = self.limits.last() {
            ensure!(
                count <= remaining,
                LimitOverrunSnafu {
                    requested: count,
                    remaining,
                }
            );
        }
        for limit in &mut self.limits {
            *limit -= count;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.advance(1)?;
        let mut buf = [0; 1];
        self.inner
            .read_exact(&mut buf)
            .context(ReadBytesSnafu { bytes: 1_u64 })?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.advance(2)?;
        ByteOrdered::runtime(&mut self.inner, self.endianness)
            .read_u16()
            .context(ReadBytesSnafu { bytes: 2_u64 })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.advance(4)?;
        ByteOrdered::runtime(&mut self.inner, self.endianness)
            .read_u32()
            .context(ReadBytesSnafu { bytes: 4_u64 })
    }

    /// Read the next `count` bytes into a new buffer.
    pub fn read_bytes(&mut self, count: u64) -> Result<Vec<u8>> {
        self.advance(count)?;
        let mut buf = vec![0; count as usize];
        self.inner
            .read_exact(&mut buf)
            .context(ReadBytesSnafu { bytes: count })?;
        Ok(buf)
    }

    /// Read the next `count` bytes as ISO-646 text.
    pub fn read_string(&mut self, count: u64) -> Result<String> {
        let bytes = self.read_bytes(count)?;
        let text = std::str::from_utf8(&bytes).context(DecodeTextSnafu)?;
        Ok(text.to_string())
    }

    /// Consume and discard the next `count` bytes.
    pub fn skip(&mut self, count: u64) -> Result<()> {
        self.advance(count)?;
        let mut remaining = count;
        let mut chunk = [0; 512];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            self.inner
                .read_exact(&mut chunk[..take])
                .context(ReadBytesSnafu { bytes: count })?;
            remaining -= take as u64;
        }
        Ok(())
    }
}

/// A byte buffer writer with a configurable byte order.
///
/// Strings are emitted as raw bytes without a terminator.
#[derive(Debug)]
pub struct DulWriter {
    buffer: Vec<u8>,
    endianness: Endianness,
}

impl DulWriter {
    /// Create a new, empty writer.
    pub fn new(endianness: Endianness) -> Self {
        DulWriter {
            buffer: Vec::new(),
            endianness,
        }
    }

    /// Create a new, empty writer with the given buffer capacity.
    pub fn with_capacity(endianness: Endianness, capacity: usize) -> Self {
        DulWriter {
            buffer: Vec::with_capacity(capacity),
            endianness,
        }
    }

    /// The number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the accumulated bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        match self.endianness {
            Endianness::Big => self.buffer.extend_from_slice(&value.to_be_bytes()),
            Endianness::Little => self.buffer.extend_from_slice(&value.to_le_bytes()),
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        match self.endianness {
            Endianness::Big => self.buffer.extend_from_slice(&value.to_be_bytes()),
            Endianness::Little => self.buffer.extend_from_slice(&value.to_le_bytes()),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }

    pub fn write_string(&mut self, text: &str) {
        self.buffer.extend_from_slice(text.as_bytes());
    }

    /// Write an application entity title,
    /// space-padded or truncated to exactly 16 bytes.
    pub fn write_ae_title(&mut self, ae_title: &str) {
        let mut bytes = ae_title.as_bytes().to_vec();
        bytes.resize(AE_TITLE_LENGTH, b' ');
        self.buffer.extend_from_slice(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[test]
    fn limits_bound_reads() {
        let data = [0x01_u8, 0x02, 0x03, 0x04, 0x05, 0x06];
        let mut reader = DulReader::new(&data[..], Endianness::Big);

        reader.push_limit(4).unwrap();
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert!(!reader.is_limit_exhausted());
        assert_eq!(reader.read_u16().unwrap(), 0x0304);
        assert!(reader.is_limit_exhausted());

        // limit is spent, the next read must fail without consuming
        assert!(matches!(
            reader.read_u8(),
            Err(Error::LimitOverrun { .. })
        ));

        reader.pop_limit().unwrap();
        assert_eq!(reader.read_u8().unwrap(), 0x05);
    }

    #[test]
    fn pop_limit_skips_shortfall() {
        let data = [0xAA_u8, 0xBB, 0xCC, 0xDD];
        let mut reader = DulReader::new(&data[..], Endianness::Big);

        reader.push_limit(3).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 0xAA);
        reader.pop_limit().unwrap();

        assert_eq!(reader.read_u8().unwrap(), 0xDD);
    }

    #[test]
    fn nested_limit_cannot_exceed_outer() {
        let data = [0_u8; 8];
        let mut reader = DulReader::new(&data[..], Endianness::Big);

        reader.push_limit(4).unwrap();
        assert!(matches!(
            reader.push_limit(6),
            Err(Error::LimitTooLarge { .. })
        ));
        reader.push_limit(4).unwrap();
    }

    #[test]
    fn endianness_is_honored() {
        let data = [0x01_u8, 0x02, 0x03, 0x04];
        let mut be = DulReader::new(&data[..], Endianness::Big);
        assert_eq!(be.read_u32().unwrap(), 0x0102_0304);
        let mut le = DulReader::new(&data[..], Endianness::Little);
        assert_eq!(le.read_u32().unwrap(), 0x0403_0201);

        let mut writer = DulWriter::new(Endianness::Big);
        writer.write_u16(0x0102);
        writer.write_u32(0x0304_0506);
        assert_eq!(writer.as_slice(), &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn ae_title_is_padded_or_truncated() {
        let mut writer = DulWriter::new(Endianness::Big);
        writer.write_ae_title("STORE-SCP");
        assert_eq!(writer.as_slice(), b"STORE-SCP       ");

        let mut writer = DulWriter::new(Endianness::Big);
        writer.write_ae_title("AN-UNREASONABLY-LONG-TITLE");
        assert_eq!(writer.as_slice(), b"AN-UNREASONABLY-");
        assert_eq!(writer.len(), AE_TITLE_LENGTH);
    }
}
