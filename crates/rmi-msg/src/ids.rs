//! Identifiers for registries and exposed objects.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use rmi_bytes::{EncodeResult, Readable, Reader, Writeable, Writer};

use crate::Error;

/// Number of bytes in a [`RegistryId`].
pub const REGISTRY_ID_LEN: usize = 40;

/// A random token identifying one registry instance.
///
/// Registry identifiers are 320 bits of randomness, chosen once per
/// registry at startup.  Their size makes accidental collisions between
/// processes implausible, which is what lets two peers detect that a
/// connection loops back to its own registry by comparing identifiers at
/// handshake time.
///
/// On the wire inside messages an identifier travels as its raw bytes;
/// during the pre-stream handshake it travels as an 80-nibble hex string.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegistryId([u8; REGISTRY_ID_LEN]);

impl RegistryId {
    /// Construct a RegistryId from a byte array.
    pub fn from_bytes(bytes: [u8; REGISTRY_ID_LEN]) -> Self {
        RegistryId(bytes)
    }
    /// Return a reference to the bytes of this identifier.
    pub fn as_bytes(&self) -> &[u8; REGISTRY_ID_LEN] {
        &self.0
    }
}

impl Display for RegistryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RegistryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // The full token is 80 characters; the first few are plenty to
        // tell registries apart in logs.
        write!(
            f,
            "RegistryId({:02x}{:02x}{:02x}{:02x}…)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl FromStr for RegistryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        /// Parse one hex nibble.
        fn nibble(c: u8) -> Result<u8, Error> {
            match c {
                b'0'..=b'9' => Ok(c - b'0'),
                b'a'..=b'f' => Ok(c - b'a' + 10),
                b'A'..=b'F' => Ok(c - b'A' + 10),
                _ => Err(Error::Proto("bad hex in registry identifier".into())),
            }
        }

        let s = s.as_bytes();
        if s.len() != REGISTRY_ID_LEN * 2 {
            return Err(Error::Proto("registry identifier had wrong length".into()));
        }
        let mut bytes = [0_u8; REGISTRY_ID_LEN];
        for (i, pair) in s.chunks(2).enumerate() {
            bytes[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
        }
        Ok(RegistryId(bytes))
    }
}

impl Readable for RegistryId {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        Ok(RegistryId(r.extract()?))
    }
}

impl Writeable for RegistryId {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(&self.0[..]);
        Ok(())
    }
}

/// Identifier of one object exposed by a registry.
///
/// Object identifiers are either chosen by the publisher (a service name
/// such as `"svc"`) or generated by the registry (`###<n>`).  They are
/// unique within their registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    /// Return this identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        ObjectId(s)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        ObjectId(s.to_owned())
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Readable for ObjectId {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        Ok(ObjectId(r.take_utf8()?))
    }
}

impl Writeable for ObjectId {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_utf8(&self.0)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn registry_id_hex() {
        let mut bytes = [0_u8; REGISTRY_ID_LEN];
        bytes[0] = 0xab;
        bytes[39] = 0x01;
        let id = RegistryId::from_bytes(bytes);
        let hex = id.to_string();
        assert_eq!(hex.len(), 80);
        assert!(hex.starts_with("ab"));
        assert!(hex.ends_with("01"));

        let parsed: RegistryId = hex.parse().unwrap();
        assert_eq!(parsed, id);

        assert!("abcd".parse::<RegistryId>().is_err());
        assert!("zz".repeat(40).parse::<RegistryId>().is_err());
    }

    #[test]
    fn object_id_wire() {
        let id: ObjectId = "###7".into();
        let mut v: Vec<u8> = Vec::new();
        v.write(&id).unwrap();
        assert_eq!(&v[..], &[0x00, 0x04, b'#', b'#', b'#', b'7']);

        let mut r = Reader::from_slice(&v[..]);
        let back: ObjectId = r.extract().unwrap();
        assert_eq!(back, id);
        assert_eq!(back.as_str(), "###7");
    }
}
