//! Internal: Declare the Reader type for rmi-bytes

use crate::{Error, Readable, Result};

/// A type for reading messages from a slice of bytes.
///
/// Unlike io::Read, this object has a simpler error type, and is designed
/// for in-memory parsing only.
///
/// # Examples
///
/// You can use a Reader to extract information byte-by-byte:
///
/// ```
/// use rmi_bytes::{Reader,Result};
/// let msg = [ 0x00, 0x01, 0x23, 0x45, 0x22, 0x00, 0x00, 0x00 ];
/// let mut b = Reader::from_slice(&msg[..]);
/// // Multi-byte values are always big-endian.
/// assert_eq!(b.take_u32()?, 0x12345);
/// assert_eq!(b.take_u8()?, 0x22);
///
/// // You can check on the length of the message...
/// assert_eq!(b.total_len(), 8);
/// assert_eq!(b.consumed(), 5);
/// assert_eq!(b.remaining(), 3);
/// // then skip over some bytes...
/// b.advance(3)?;
/// // ... and check that the message is really exhausted.
/// b.should_be_exhausted()?;
/// # Result::Ok(())
/// ```
///
/// You can also use a Reader to extract objects that implement Readable.
pub struct Reader<'a> {
    /// The underlying slice that we're reading from
    b: &'a [u8],
    /// The next position in the slice that we intend to read from.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader from a slice of bytes.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { b: slice, off: 0 }
    }
    /// Construct a new Reader from a 'Bytes' object.
    pub fn from_bytes(b: &'a bytes::Bytes) -> Self {
        Self::from_slice(b.as_ref())
    }
    /// Return the total length of the slice in this reader, including
    /// consumed bytes and remaining bytes.
    pub fn total_len(&self) -> usize {
        self.b.len()
    }
    /// Return the total number of bytes in this reader that have not
    /// yet been read.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }
    /// Consume this reader, and return a slice containing the remaining
    /// bytes from its slice that it did not consume.
    pub fn into_rest(self) -> &'a [u8] {
        &self.b[self.off..]
    }
    /// Return the total number of bytes in this reader that have
    /// already been read.
    pub fn consumed(&self) -> usize {
        self.off
    }
    /// Skip `n` bytes from the reader.
    ///
    /// Returns Ok on success.  Returns Err(Error::Truncated) if there were
    /// not enough bytes to skip.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.peek(n)?;
        self.off += n;
        Ok(())
    }
    /// Check whether this reader is exhausted (out of bytes).
    ///
    /// Return Ok if it is, and Err(Error::ExtraneousBytes)
    /// if there were extra bytes.
    pub fn should_be_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::ExtraneousBytes);
        }
        Ok(())
    }
    /// Truncate this reader, so that no more than `n` bytes remain.
    ///
    /// Fewer than `n` bytes may remain if there were not enough bytes
    /// to begin with.
    pub fn truncate(&mut self, n: usize) {
        if n < self.remaining() {
            self.b = &self.b[..self.off + n];
        }
    }
    /// Try to return a slice of `n` bytes from this reader without
    /// consuming them.
    ///
    /// On success, returns Ok(slice).  If there are fewer than n
    /// bytes, returns Err(Error::Truncated).
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Truncated {
                deficit: n - self.remaining(),
            });
        }

        Ok(&self.b[self.off..(n + self.off)])
    }
    /// Try to consume and return a slice of `n` bytes from this reader.
    ///
    /// On success, returns Ok(Slice).  If there are fewer than n
    /// bytes, returns Err(Error::Truncated).
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let b = self.peek(n)?;
        self.advance(n)?;
        Ok(b)
    }
    /// Try to fill a provided buffer with bytes consumed from this reader.
    ///
    /// On success, the buffer will be filled with data from the
    /// reader, the reader will advance by the length of the buffer,
    /// and we'll return Ok(()).  On failure the buffer will be
    /// unchanged.
    pub fn take_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = buf.len();
        let b = self.take(n)?;
        buf.copy_from_slice(b);
        Ok(())
    }
    /// Try to consume and return a u8 from this reader.
    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }
    /// Try to consume and return a big-endian u16 from this reader.
    pub fn take_u16(&mut self) -> Result<u16> {
        let b: [u8; 2] = self.extract()?;
        let r = u16::from_be_bytes(b);
        Ok(r)
    }
    /// Try to consume and return a big-endian u32 from this reader.
    pub fn take_u32(&mut self) -> Result<u32> {
        let b: [u8; 4] = self.extract()?;
        let r = u32::from_be_bytes(b);
        Ok(r)
    }
    /// Try to consume and return a big-endian u64 from this reader.
    pub fn take_u64(&mut self) -> Result<u64> {
        let b: [u8; 8] = self.extract()?;
        let r = u64::from_be_bytes(b);
        Ok(r)
    }
    /// Try to consume and return a length-prefixed UTF-8 string.
    ///
    /// The string is encoded as a big-endian u16 byte count followed by
    /// that many bytes of UTF-8.
    pub fn take_utf8(&mut self) -> Result<String> {
        let n = self.take_u16()? as usize;
        let body = self.take(n)?;
        String::from_utf8(body.into()).map_err(|_| Error::BadUtf8)
    }
    /// Try to decode and remove a Readable from this reader, using its
    /// take_from() method.
    ///
    /// On failure, consumes nothing.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        let off_orig = self.off;
        let result = E::take_from(self);
        if result.is_err() {
            // We encountered an error; we should rewind.
            self.off = off_orig;
        }
        result
    }

    /// Try to decode and remove `n` Readables from this reader, using the
    /// Readable's take_from() method.
    ///
    /// On failure, consumes nothing.
    pub fn extract_n<E: Readable>(&mut self, n: usize) -> Result<Vec<E>> {
        // This `min` defends against a pathological case where the input
        // claims that BIGNUM elements are forthcoming, and our attempt to
        // allocate `Vec::with_capacity(BIGNUM)` makes us panic.
        let n_alloc = std::cmp::min(n, self.remaining());
        let mut result = Vec::with_capacity(n_alloc);
        let off_orig = self.off;
        for _ in 0..n {
            match E::take_from(self) {
                Ok(item) => result.push(item),
                Err(e) => {
                    // Encountered an error; we should rewind.
                    self.off = off_orig;
                    return Err(e);
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn bytecursor_read_ok() {
        let bytes = b"On a mountain halfway between Reno and Rome";
        let mut bc = Reader::from_slice(&bytes[..]);

        assert_eq!(bc.total_len(), 43);
        assert_eq!(bc.remaining(), 43);
        assert_eq!(bc.consumed(), 0);

        assert_eq!(bc.take_u8().unwrap(), 0x4f);
        assert_eq!(bc.take_u16().unwrap(), 0x6e20);
        assert_eq!(bc.take_u32().unwrap(), 0x61206d6f);
        assert_eq!(bc.take_u64().unwrap(), 0x756e7461696e2068);
        assert_eq!(bc.take(6).unwrap(), &b"alfway"[..]);
        assert_eq!(bc.remaining(), 43 - 21);
        bc.advance(9).unwrap();
        assert_eq!(bc.take(4).unwrap(), &b"Reno"[..]);
        assert_eq!(bc.consumed(), 34);

        let mut v = [0_u8; 4];
        bc.advance(5).unwrap();
        bc.take_into(&mut v[..]).unwrap();
        assert_eq!(&v[..], &b"Rome"[..]);

        assert!(bc.should_be_exhausted().is_ok());
        assert_eq!(bc.into_rest(), &b""[..]);
    }

    #[test]
    fn read_errors() {
        let bytes = b"moon";
        let mut bc = Reader::from_slice(&bytes[..]);

        assert_eq!(
            bc.take(6).unwrap_err(),
            Error::Truncated { deficit: 2 }
        );
        assert_eq!(bc.take_u64().unwrap_err(), Error::Truncated { deficit: 4 });
        bc.advance(4).unwrap();
        assert!(bc.should_be_exhausted().is_ok());
        assert_eq!(bc.take_u8().unwrap_err(), Error::Truncated { deficit: 1 });

        let mut bc = Reader::from_slice(&bytes[..]);
        assert_eq!(bc.should_be_exhausted().unwrap_err(), Error::ExtraneousBytes);
    }

    #[test]
    fn utf8_strings() {
        let bytes = [0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0x00, 0x01, 0xff];
        let mut bc = Reader::from_slice(&bytes[..]);
        assert_eq!(bc.take_utf8().unwrap(), "hello");
        // A one-byte string that isn't UTF-8.
        assert_eq!(bc.take_utf8().unwrap_err(), Error::BadUtf8);

        // Claimed length exceeds the buffer.
        let bytes = [0x00, 0x09, b'o', b'o', b'p', b's'];
        let mut bc = Reader::from_slice(&bytes[..]);
        assert!(matches!(
            bc.take_utf8().unwrap_err(),
            Error::Truncated { .. }
        ));
    }

    #[test]
    fn extract() {
        #[derive(Debug, PartialEq)]
        struct Pair(u8, u8);
        impl Readable for Pair {
            fn take_from(r: &mut Reader<'_>) -> Result<Self> {
                Ok(Pair(r.take_u8()?, r.take_u8()?))
            }
        }

        let bytes = [1, 2, 3, 4, 5];
        let mut bc = Reader::from_slice(&bytes[..]);
        let p: Pair = bc.extract().unwrap();
        assert_eq!(p, Pair(1, 2));
        let ps: Vec<Pair> = bc.extract_n(1).unwrap();
        assert_eq!(ps, vec![Pair(3, 4)]);

        // Not enough bytes for two more pairs: nothing is consumed.
        let consumed = bc.consumed();
        let e: Result<Vec<Pair>> = bc.extract_n(2);
        assert!(e.is_err());
        assert_eq!(bc.consumed(), consumed);
    }

    #[test]
    fn truncate() {
        let bytes = b"under the sea";
        let mut bc = Reader::from_slice(&bytes[..]);
        bc.advance(6).unwrap();
        bc.truncate(3);
        assert_eq!(bc.take(3).unwrap(), &b"the"[..]);
        assert!(bc.should_be_exhausted().is_ok());
    }
}
