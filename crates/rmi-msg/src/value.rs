//! The self-describing value graphs carried inside messages.
//!
//! Invocation parameters and return values travel as trees of [`Value`].
//! A `Value` is either plain data (scalars, strings, byte strings, lists,
//! and named structs) or a [`StubRef`]: a proxy descriptor standing in for
//! a remote-capable object.  The graph rewrite that decides which objects
//! become descriptors lives in `rmi-proto`; by the time a tree reaches
//! this crate it is already in wire form.

use std::fmt::{self, Display, Formatter};

use rmi_bytes::{EncodeResult, Readable, Reader, Writeable, Writer};

use crate::ids::{ObjectId, RegistryId};

/// Greatest nesting depth we will accept when decoding a value graph.
///
/// Inbound data is attacker-controlled; without a cap, a short frame of
/// nested list headers could drive the decoder into unbounded recursion.
const MAX_DEPTH: usize = 64;

/// A single node in a value graph.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// The absent value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.  Narrower integer types widen into this on the
    /// wire and are narrowed again by the receiver's type descriptors.
    Int(i64),
    /// A double-precision float.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// An opaque byte string.
    Bytes(Vec<u8>),
    /// An ordered sequence of values.
    List(Vec<Value>),
    /// A named aggregate with ordered fields.
    Struct(StructValue),
    /// A proxy descriptor for a remote-capable object.
    Remote(StubRef),
}

impl Value {
    /// Return the zero value for a primitive type descriptor, or `Null`
    /// for reference-shaped descriptors.
    ///
    /// Used when fault suppression is in effect and an invocation failed:
    /// the caller still needs something shaped like the declared return
    /// type.
    pub fn zero_for(type_desc: &str) -> Value {
        match type_desc {
            "bool" => Value::Bool(false),
            "i8" | "i16" | "i32" | "i64" | "u8" | "u16" | "u32" | "u64" => Value::Int(0),
            "f32" | "f64" => Value::Float(0.0),
            _ => Value::Null,
        }
    }
}

/// Tag bytes distinguishing [`Value`] variants on the wire.
mod tag {
    /// Tag for [`Value::Null`].
    pub(super) const NULL: u8 = 0;
    /// Tag for [`Value::Bool`].
    pub(super) const BOOL: u8 = 1;
    /// Tag for [`Value::Int`].
    pub(super) const INT: u8 = 2;
    /// Tag for [`Value::Float`].
    pub(super) const FLOAT: u8 = 3;
    /// Tag for [`Value::Str`].
    pub(super) const STR: u8 = 4;
    /// Tag for [`Value::Bytes`].
    pub(super) const BYTES: u8 = 5;
    /// Tag for [`Value::List`].
    pub(super) const LIST: u8 = 6;
    /// Tag for [`Value::Struct`].
    pub(super) const STRUCT: u8 = 7;
    /// Tag for [`Value::Remote`].
    pub(super) const REMOTE: u8 = 8;
}

impl Writeable for Value {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        match self {
            Value::Null => b.write_u8(tag::NULL),
            Value::Bool(v) => {
                b.write_u8(tag::BOOL);
                b.write(v)?;
            }
            Value::Int(v) => {
                b.write_u8(tag::INT);
                b.write_u64(*v as u64);
            }
            Value::Float(v) => {
                b.write_u8(tag::FLOAT);
                b.write_u64(v.to_bits());
            }
            Value::Str(v) => {
                b.write_u8(tag::STR);
                b.write_utf8(v)?;
            }
            Value::Bytes(v) => {
                b.write_u8(tag::BYTES);
                let len: u32 = v
                    .len()
                    .try_into()
                    .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
                b.write_u32(len);
                b.write_all(v);
            }
            Value::List(items) => {
                b.write_u8(tag::LIST);
                let len: u32 = items
                    .len()
                    .try_into()
                    .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
                b.write_u32(len);
                for item in items {
                    b.write(item)?;
                }
            }
            Value::Struct(s) => {
                b.write_u8(tag::STRUCT);
                b.write(s)?;
            }
            Value::Remote(r) => {
                b.write_u8(tag::REMOTE);
                b.write(r)?;
            }
        }
        Ok(())
    }
}

impl Readable for Value {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        take_value(r, 0)
    }
}

/// Recursive worker for decoding a [`Value`], enforcing [`MAX_DEPTH`].
fn take_value(r: &mut Reader<'_>, depth: usize) -> rmi_bytes::Result<Value> {
    if depth > MAX_DEPTH {
        return Err(rmi_bytes::Error::InvalidMessage(
            "value graph nested too deeply".into(),
        ));
    }
    Ok(match r.take_u8()? {
        tag::NULL => Value::Null,
        tag::BOOL => Value::Bool(r.extract()?),
        tag::INT => Value::Int(r.take_u64()? as i64),
        tag::FLOAT => Value::Float(f64::from_bits(r.take_u64()?)),
        tag::STR => Value::Str(r.take_utf8()?),
        tag::BYTES => {
            let n = r.take_u32()? as usize;
            Value::Bytes(r.take(n)?.into())
        }
        tag::LIST => {
            let n = r.take_u32()? as usize;
            // Guard the initial allocation the same way extract_n does.
            let mut items = Vec::with_capacity(std::cmp::min(n, r.remaining()));
            for _ in 0..n {
                items.push(take_value(r, depth + 1)?);
            }
            Value::List(items)
        }
        tag::STRUCT => {
            let type_name = r.take_utf8()?;
            let n = r.take_u16()? as usize;
            let mut fields = Vec::with_capacity(std::cmp::min(n, r.remaining()));
            for _ in 0..n {
                let name = r.take_utf8()?;
                fields.push((name, take_value(r, depth + 1)?));
            }
            Value::Struct(StructValue { type_name, fields })
        }
        tag::REMOTE => Value::Remote(r.extract()?),
        _ => {
            return Err(rmi_bytes::Error::InvalidMessage(
                "unrecognized value tag".into(),
            ))
        }
    })
}

/// A named aggregate value with ordered fields.
///
/// This is the wire form of a serializable object: the graph rewrite
/// shallow-copies such objects field by field, so field order here follows
/// the order the sender walked them in.
#[derive(Clone, Debug, PartialEq)]
pub struct StructValue {
    /// Name of the aggregate's type, as declared by the sender.
    pub type_name: String,
    /// The fields, in declaration order.
    pub fields: Vec<(String, Value)>,
}

impl Writeable for StructValue {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_utf8(&self.type_name)?;
        let len: u16 = self
            .fields
            .len()
            .try_into()
            .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
        b.write_u16(len);
        for (name, value) in &self.fields {
            b.write_utf8(name)?;
            b.write(value)?;
        }
        Ok(())
    }
}

/// A proxy descriptor: everything a receiver needs to build a live stub
/// for a remote object, or to recognize that the object is its own.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StubRef {
    /// Identifier of the target object within its owning registry.
    pub object_id: ObjectId,
    /// Identifier of the registry that owns the target object.
    pub registry_id: RegistryId,
    /// Host where the owning registry listens.
    pub host: String,
    /// The owning registry's listener port; 0 when the owner accepts no
    /// inbound connections, in which case the descriptor is not
    /// share-eligible and intermediaries must re-route.
    pub port: u16,
    /// Names of the remote interfaces the target exposes.
    pub interfaces: Vec<String>,
}

impl StubRef {
    /// Return true if third parties can connect straight to the origin of
    /// this descriptor.
    pub fn shareable(&self) -> bool {
        self.port != 0
    }
}

impl Writeable for StubRef {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write(&self.object_id)?;
        b.write(&self.registry_id)?;
        b.write_utf8(&self.host)?;
        b.write_u16(self.port);
        let len: u16 = self
            .interfaces
            .len()
            .try_into()
            .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
        b.write_u16(len);
        for i in &self.interfaces {
            b.write_utf8(i)?;
        }
        Ok(())
    }
}

impl Readable for StubRef {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        let object_id = r.extract()?;
        let registry_id = r.extract()?;
        let host = r.take_utf8()?;
        let port = r.take_u16()?;
        let n = r.take_u16()? as usize;
        let mut interfaces = Vec::with_capacity(std::cmp::min(n, r.remaining()));
        for _ in 0..n {
            interfaces.push(r.take_utf8()?);
        }
        Ok(StubRef {
            object_id,
            registry_id,
            host,
            port,
            interfaces,
        })
    }
}

/// Greatest cause-chain length we will accept when decoding a [`Fault`].
const MAX_CAUSE_DEPTH: usize = 16;

/// Description of an error raised on the remote side.
///
/// A fault plays the role an exception object plays locally: it names the
/// kind of failure, carries a message and the remote frames that led to
/// it, and may chain a cause.
#[derive(Clone, Debug, PartialEq)]
pub struct Fault {
    /// Name of the kind of failure (see [`kind`] for the kinds the runtime
    /// itself raises; services may use their own).
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Rendered remote stack frames, innermost first.
    pub frames: Vec<String>,
    /// The fault that caused this one, if any.
    pub cause: Option<Box<Fault>>,
}

impl Fault {
    /// Construct a fault with a kind and message and nothing else.
    pub fn new<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Fault {
            kind: kind.into(),
            message: message.into(),
            frames: Vec::new(),
            cause: None,
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for Fault {}

impl Writeable for Fault {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_utf8(&self.kind)?;
        b.write_utf8(&self.message)?;
        let len: u16 = self
            .frames
            .len()
            .try_into()
            .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
        b.write_u16(len);
        for frame in &self.frames {
            b.write_utf8(frame)?;
        }
        match &self.cause {
            Some(cause) => {
                b.write(&true)?;
                b.write(cause.as_ref())?;
            }
            None => b.write(&false)?,
        }
        Ok(())
    }
}

impl Readable for Fault {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        take_fault(r, 0)
    }
}

/// Recursive worker for decoding a [`Fault`] cause chain.
fn take_fault(r: &mut Reader<'_>, depth: usize) -> rmi_bytes::Result<Fault> {
    if depth > MAX_CAUSE_DEPTH {
        return Err(rmi_bytes::Error::InvalidMessage(
            "fault cause chain too long".into(),
        ));
    }
    let kind = r.take_utf8()?;
    let message = r.take_utf8()?;
    let n = r.take_u16()? as usize;
    let mut frames = Vec::with_capacity(std::cmp::min(n, r.remaining()));
    for _ in 0..n {
        frames.push(r.take_utf8()?);
    }
    let cause = if r.extract::<bool>()? {
        Some(Box::new(take_fault(r, depth + 1)?))
    } else {
        None
    };
    Ok(Fault {
        kind,
        message,
        frames,
        cause,
    })
}

/// Names of the fault kinds the runtime itself raises.
pub mod kind {
    /// The authenticator refused the invocation.
    pub const AUTHORIZATION: &str = "Authorization";
    /// The target object does not exist in the remote registry.
    pub const NO_SUCH_OBJECT: &str = "NoSuchObject";
    /// The target object does not implement the requested method.
    pub const NO_SUCH_METHOD: &str = "NoSuchMethod";
    /// The arguments did not match the method's declared parameters.
    pub const ILLEGAL_ARGUMENT: &str = "IllegalArgument";
    /// The requested member is not invocable remotely.
    pub const ACCESS: &str = "Access";
    /// A value in the invocation or return could not be encoded.
    pub const NOT_SERIALIZABLE: &str = "NotSerializable";
    /// The remote worker was cooperatively interrupted.
    pub const INTERRUPTED: &str = "Interrupted";
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rmi_bytes::Reader;

    /// Encode `v` and decode the result again.
    fn roundtrip(v: &Value) -> Value {
        let mut buf: Vec<u8> = Vec::new();
        buf.write(v).unwrap();
        let mut r = Reader::from_slice(&buf[..]);
        let out = r.extract().unwrap();
        r.should_be_exhausted().unwrap();
        out
    }

    fn stubref() -> StubRef {
        StubRef {
            object_id: "###3".into(),
            registry_id: RegistryId::from_bytes([0x5a; REGISTRY_ID_LEN]),
            host: "203.0.113.9".into(),
            port: 4040,
            interfaces: vec!["demo.Clock".into()],
        }
    }

    use crate::REGISTRY_ID_LEN;

    #[test]
    fn scalar_wire_form() {
        let mut buf: Vec<u8> = Vec::new();
        buf.write(&Value::Int(-2)).unwrap();
        assert_eq!(
            &buf[..],
            &[2, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]
        );

        let mut buf: Vec<u8> = Vec::new();
        buf.write(&Value::Null).unwrap();
        assert_eq!(&buf[..], &[0]);
    }

    #[test]
    fn mixed_graph_roundtrip() {
        let v = Value::Struct(StructValue {
            type_name: "demo.Weather".into(),
            fields: vec![
                ("station".into(), Value::Str("reno".into())),
                ("temps".into(), Value::List(vec![Value::Float(9.5), Value::Null])),
                ("sensor".into(), Value::Remote(stubref())),
                ("raw".into(), Value::Bytes(vec![1, 2, 3])),
            ],
        });
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn depth_limit() {
        let mut v = Value::Int(1);
        for _ in 0..200 {
            v = Value::List(vec![v]);
        }
        let mut buf: Vec<u8> = Vec::new();
        buf.write(&v).unwrap();
        let mut r = Reader::from_slice(&buf[..]);
        assert!(r.extract::<Value>().is_err());
    }

    #[test]
    fn bad_tag() {
        let mut r = Reader::from_slice(&[200]);
        assert!(r.extract::<Value>().is_err());
    }

    #[test]
    fn zero_values() {
        assert_eq!(Value::zero_for("i32"), Value::Int(0));
        assert_eq!(Value::zero_for("bool"), Value::Bool(false));
        assert_eq!(Value::zero_for("f64"), Value::Float(0.0));
        assert_eq!(Value::zero_for("demo.Clock"), Value::Null);
    }

    #[test]
    fn fault_roundtrip() {
        let f = Fault {
            kind: "NoSuchMethod".into(),
            message: "tell_time".into(),
            frames: vec!["demo::clock::dispatch".into()],
            cause: Some(Box::new(Fault::new("Access", "private member"))),
        };
        let mut buf: Vec<u8> = Vec::new();
        buf.write(&f).unwrap();
        let mut r = Reader::from_slice(&buf[..]);
        let back: Fault = r.extract().unwrap();
        assert_eq!(back, f);
        assert_eq!(
            back.to_string(),
            "NoSuchMethod: tell_time (caused by Access: private member)"
        );
    }

    #[test]
    fn shareable() {
        let mut s = stubref();
        assert!(s.shareable());
        s.port = 0;
        assert!(!s.shareable());
    }
}
