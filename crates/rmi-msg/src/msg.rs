//! Different kinds of messages that can travel between registries.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

use rmi_bytes::{EncodeResult, Readable, Reader, Writeable, Writer};

use crate::ids::ObjectId;
use crate::value::{Fault, Value};

/// The type of a message, as a command byte on the wire.
///
/// The value of the MsgCmd indicates the meaning of a frame's body.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MsgCmd(u8);

impl MsgCmd {
    /// A method invocation request.
    pub const INVOCATION: MsgCmd = MsgCmd(1);
    /// The outcome of a previously sent invocation.
    pub const RETURN: MsgCmd = MsgCmd(2);
    /// The peer now holds a reference to one of our objects.
    pub const NEW_REFERENCE: MsgCmd = MsgCmd(3);
    /// The peer dropped a reference to one of our objects.
    pub const FINALIZE: MsgCmd = MsgCmd(4);
    /// The peer used a cached result; the object is still live.
    pub const REFERENCE_USE: MsgCmd = MsgCmd(5);
    /// Request for, or response with, an object's remote interfaces.
    pub const REMOTE_INTERFACE: MsgCmd = MsgCmd(6);
    /// Codebase source hints for unknown inbound types.
    pub const CODEBASE_UPDATE: MsgCmd = MsgCmd(7);
    /// Cooperative cancellation of a running invocation.
    pub const INTERRUPTION: MsgCmd = MsgCmd(8);
}

impl From<u8> for MsgCmd {
    fn from(v: u8) -> MsgCmd {
        MsgCmd(v)
    }
}

impl From<MsgCmd> for u8 {
    fn from(cmd: MsgCmd) -> u8 {
        cmd.0
    }
}

impl Display for MsgCmd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            MsgCmd::INVOCATION => "INVOCATION",
            MsgCmd::RETURN => "RETURN",
            MsgCmd::NEW_REFERENCE => "NEW_REFERENCE",
            MsgCmd::FINALIZE => "FINALIZE",
            MsgCmd::REFERENCE_USE => "REFERENCE_USE",
            MsgCmd::REMOTE_INTERFACE => "REMOTE_INTERFACE",
            MsgCmd::CODEBASE_UPDATE => "CODEBASE_UPDATE",
            MsgCmd::INTERRUPTION => "INTERRUPTION",
            MsgCmd(other) => return write!(f, "UNRECOGNIZED({})", other),
        };
        write!(f, "{}", name)
    }
}

impl fmt::Debug for MsgCmd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Trait for the bodies of messages.
pub trait Body: Readable {
    /// Decode a message body from a provided reader.
    fn decode_from_reader(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        r.extract()
    }
    /// Consume this message and encode its body onto `w`.
    ///
    /// Does not encode anything _but_ the body: the command byte and frame
    /// length live in the framing layer.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()>;
}

/// A request to run one method of one exposed object.
///
/// Invocation identifiers increase monotonically per stub; together with
/// the sender's registry identifier they key the receiver's invocation
/// cache, which is what makes re-sending an invocation after a connection
/// fault safe.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    /// Correlation id, scoped to the sending stub.
    id: u64,
    /// The target object.
    object_id: ObjectId,
    /// Name of the method to run.
    method: String,
    /// Declared parameter types, in order.
    param_types: Vec<String>,
    /// The arguments, in order, already rewritten into wire form.
    params: Vec<Value>,
    /// True if the sender will not wait for the Return.
    asynchronous: bool,
}

impl Invocation {
    /// Construct a new Invocation.
    pub fn new(
        id: u64,
        object_id: ObjectId,
        method: impl Into<String>,
        param_types: Vec<String>,
        params: Vec<Value>,
        asynchronous: bool,
    ) -> Self {
        Invocation {
            id,
            object_id,
            method: method.into(),
            param_types,
            params,
            asynchronous,
        }
    }
    /// Return this invocation's correlation id.
    pub fn id(&self) -> u64 {
        self.id
    }
    /// Return the identifier of the target object.
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }
    /// Return the name of the method to run.
    pub fn method(&self) -> &str {
        &self.method
    }
    /// Return the declared parameter types.
    pub fn param_types(&self) -> &[String] {
        &self.param_types
    }
    /// Return the arguments.
    pub fn params(&self) -> &[Value] {
        &self.params
    }
    /// Return true if the sender will not wait for the Return.
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }
    /// Consume this invocation, returning the pieces a dispatcher needs.
    pub fn into_parts(self) -> (u64, ObjectId, String, Vec<String>, Vec<Value>, bool) {
        (
            self.id,
            self.object_id,
            self.method,
            self.param_types,
            self.params,
            self.asynchronous,
        )
    }
}

impl Body for Invocation {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u64(self.id);
        w.write(&self.object_id)?;
        w.write_utf8(&self.method)?;
        write_str_list(w, &self.param_types)?;
        let len: u16 = self
            .params
            .len()
            .try_into()
            .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
        w.write_u16(len);
        for p in &self.params {
            w.write(p)?;
        }
        w.write(&self.asynchronous)?;
        Ok(())
    }
}

impl Readable for Invocation {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        let id = r.take_u64()?;
        let object_id = r.extract()?;
        let method = r.take_utf8()?;
        let param_types = take_str_list(r)?;
        let n = r.take_u16()? as usize;
        let params = r.extract_n(n)?;
        let asynchronous = r.extract()?;
        Ok(Invocation {
            id,
            object_id,
            method,
            param_types,
            params,
            asynchronous,
        })
    }
}

/// The outcome of an invocation: a value, or a fault.
#[derive(Clone, Debug, PartialEq)]
pub struct Return {
    /// Correlation id of the invocation this responds to.
    id: u64,
    /// Declared type of the returned value, when the method declares one.
    return_type: Option<String>,
    /// What happened: the returned value, or the fault that was raised.
    outcome: Result<Value, Fault>,
}

impl Return {
    /// Construct a new Return.
    pub fn new(id: u64, return_type: Option<String>, outcome: Result<Value, Fault>) -> Self {
        Return {
            id,
            return_type,
            outcome,
        }
    }
    /// Return the correlation id of the invocation this responds to.
    pub fn id(&self) -> u64 {
        self.id
    }
    /// Return the declared return type, if any.
    pub fn return_type(&self) -> Option<&str> {
        self.return_type.as_deref()
    }
    /// Return a reference to the outcome.
    pub fn outcome(&self) -> &Result<Value, Fault> {
        &self.outcome
    }
    /// Consume this message, returning the declared type and the outcome.
    pub fn into_outcome(self) -> (Option<String>, Result<Value, Fault>) {
        (self.return_type, self.outcome)
    }
}

impl Body for Return {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u64(self.id);
        match &self.return_type {
            Some(t) => {
                w.write(&true)?;
                w.write_utf8(t)?;
            }
            None => w.write(&false)?,
        }
        match &self.outcome {
            Ok(value) => {
                w.write_u8(0);
                w.write(value)?;
            }
            Err(fault) => {
                w.write_u8(1);
                w.write(fault)?;
            }
        }
        Ok(())
    }
}

impl Readable for Return {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        let id = r.take_u64()?;
        let return_type = if r.extract::<bool>()? {
            Some(r.take_utf8()?)
        } else {
            None
        };
        let outcome = match r.take_u8()? {
            0 => Ok(r.extract()?),
            1 => Err(r.extract()?),
            _ => {
                return Err(rmi_bytes::Error::InvalidMessage(
                    "bad outcome discriminant in RETURN".into(),
                ))
            }
        };
        Ok(Return {
            id,
            return_type,
            outcome,
        })
    }
}

/// Declare a message whose body is a single object identifier.
macro_rules! object_id_msg {
    {
        $(#[$meta:meta])*
        $name:ident
    } => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name {
            /// The object this notice is about.
            object_id: ObjectId,
        }
        impl $name {
            /// Construct a new message about `object_id`.
            pub fn new<I: Into<ObjectId>>(object_id: I) -> Self {
                $name { object_id: object_id.into() }
            }
            /// Return the identifier of the object this notice is about.
            pub fn object_id(&self) -> &ObjectId {
                &self.object_id
            }
        }
        impl Body for $name {
            fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
                w.write(&self.object_id)?;
                Ok(())
            }
        }
        impl Readable for $name {
            fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
                Ok($name { object_id: r.extract()? })
            }
        }
    }
}

object_id_msg! {
    /// Notice that the sender now holds a reference to the named object.
    ///
    /// Sent when a stub is constructed or re-hydrated from a descriptor.
    /// The receiver increments the object's per-handler reference count,
    /// which keeps the object published.
    NewReference
}

object_id_msg! {
    /// Notice that the sender has dropped its reference to the named
    /// object.
    ///
    /// This is the client half of the distributed garbage collector: the
    /// receiver decrements the per-handler reference count, and the object
    /// becomes collectable once every count reaches zero and no names are
    /// bound.
    Finalize
}

object_id_msg! {
    /// Notice that the sender used a locally cached result of the named
    /// object.
    ///
    /// Refreshes the object's last-use time so the lease reaper does not
    /// collect an object whose results are still being consumed.
    ReferenceUse
}

/// Request for, or response with, the remote interfaces of an object.
///
/// The two directions share a type: a message without an interface list is
/// a request, and one with a list is the response, correlated by id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteInterface {
    /// Correlation id, scoped to the requesting stub.
    id: u64,
    /// The object whose interfaces are wanted.
    object_id: ObjectId,
    /// In a response, the interface names; absent in a request.
    interfaces: Option<Vec<String>>,
}

impl RemoteInterface {
    /// Construct a request for the interfaces of `object_id`.
    pub fn request(id: u64, object_id: ObjectId) -> Self {
        RemoteInterface {
            id,
            object_id,
            interfaces: None,
        }
    }
    /// Construct a response carrying `interfaces`.
    pub fn response(id: u64, object_id: ObjectId, interfaces: Vec<String>) -> Self {
        RemoteInterface {
            id,
            object_id,
            interfaces: Some(interfaces),
        }
    }
    /// Return this message's correlation id.
    pub fn id(&self) -> u64 {
        self.id
    }
    /// Return the identifier of the object whose interfaces are wanted.
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }
    /// Return the interface list, if this is a response.
    pub fn interfaces(&self) -> Option<&[String]> {
        self.interfaces.as_deref()
    }
    /// Consume this message, returning the interface list if present.
    pub fn into_interfaces(self) -> Option<Vec<String>> {
        self.interfaces
    }
}

impl Body for RemoteInterface {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u64(self.id);
        w.write(&self.object_id)?;
        match &self.interfaces {
            Some(list) => {
                w.write(&true)?;
                write_str_list(w, list)?;
            }
            None => w.write(&false)?,
        }
        Ok(())
    }
}

impl Readable for RemoteInterface {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        let id = r.take_u64()?;
        let object_id = r.extract()?;
        let interfaces = if r.extract::<bool>()? {
            Some(take_str_list(r)?)
        } else {
            None
        };
        Ok(RemoteInterface {
            id,
            object_id,
            interfaces,
        })
    }
}

/// Codebase source hints, for receivers that resolve unknown inbound
/// types from a codebase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodebaseUpdate {
    /// The source URLs, deduplicated and ordered.
    urls: BTreeSet<String>,
}

impl CodebaseUpdate {
    /// Construct a new CodebaseUpdate from any collection of URLs.
    pub fn new<I: IntoIterator<Item = String>>(urls: I) -> Self {
        CodebaseUpdate {
            urls: urls.into_iter().collect(),
        }
    }
    /// Return the set of source URLs.
    pub fn urls(&self) -> &BTreeSet<String> {
        &self.urls
    }
    /// Consume this message and return the set of source URLs.
    pub fn into_urls(self) -> BTreeSet<String> {
        self.urls
    }
}

impl Body for CodebaseUpdate {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        let len: u16 = self
            .urls
            .len()
            .try_into()
            .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
        w.write_u16(len);
        for url in &self.urls {
            w.write_utf8(url)?;
        }
        Ok(())
    }
}

impl Readable for CodebaseUpdate {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        let list = take_str_list(r)?;
        Ok(CodebaseUpdate {
            urls: list.into_iter().collect(),
        })
    }
}

/// Cooperative cancellation of a running invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interruption {
    /// Correlation id of the invocation to interrupt.
    id: u64,
}

impl Interruption {
    /// Construct a new Interruption for invocation `id`.
    pub fn new(id: u64) -> Self {
        Interruption { id }
    }
    /// Return the correlation id of the invocation to interrupt.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Body for Interruption {
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u64(self.id);
        Ok(())
    }
}

impl Readable for Interruption {
    fn take_from(r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        Ok(Interruption {
            id: r.take_u64()?,
        })
    }
}

/// Helper: encode a u16-counted list of length-prefixed strings.
fn write_str_list<W: Writer + ?Sized>(w: &mut W, list: &[String]) -> EncodeResult<()> {
    let len: u16 = list
        .len()
        .try_into()
        .map_err(|_| rmi_bytes::EncodeError::BadLengthValue)?;
    w.write_u16(len);
    for s in list {
        w.write_utf8(s)?;
    }
    Ok(())
}

/// Helper: decode a u16-counted list of length-prefixed strings.
fn take_str_list(r: &mut Reader<'_>) -> rmi_bytes::Result<Vec<String>> {
    let n = r.take_u16()? as usize;
    let mut list = Vec::with_capacity(std::cmp::min(n, r.remaining()));
    for _ in 0..n {
        list.push(r.take_utf8()?);
    }
    Ok(list)
}

/// A decoded message of unrestricted type.
///
/// An AnyMsg is an item received on a connection between registries: one
/// member of the closed message set.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum AnyMsg {
    /// A method invocation request.
    Invocation(Invocation),
    /// The outcome of an invocation.
    Return(Return),
    /// A new remote reference was taken.
    NewReference(NewReference),
    /// A remote reference was dropped.
    Finalize(Finalize),
    /// A cached result was used.
    ReferenceUse(ReferenceUse),
    /// Interface introspection request or response.
    RemoteInterface(RemoteInterface),
    /// Codebase source hints.
    CodebaseUpdate(CodebaseUpdate),
    /// Cancellation of a running invocation.
    Interruption(Interruption),
}

impl AnyMsg {
    /// Return the command byte for this message.
    pub fn cmd(&self) -> MsgCmd {
        match self {
            AnyMsg::Invocation(_) => MsgCmd::INVOCATION,
            AnyMsg::Return(_) => MsgCmd::RETURN,
            AnyMsg::NewReference(_) => MsgCmd::NEW_REFERENCE,
            AnyMsg::Finalize(_) => MsgCmd::FINALIZE,
            AnyMsg::ReferenceUse(_) => MsgCmd::REFERENCE_USE,
            AnyMsg::RemoteInterface(_) => MsgCmd::REMOTE_INTERFACE,
            AnyMsg::CodebaseUpdate(_) => MsgCmd::CODEBASE_UPDATE,
            AnyMsg::Interruption(_) => MsgCmd::INTERRUPTION,
        }
    }

    /// Write the body of this message (not including command or length).
    pub fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        match self {
            AnyMsg::Invocation(b) => b.encode_onto(w),
            AnyMsg::Return(b) => b.encode_onto(w),
            AnyMsg::NewReference(b) => b.encode_onto(w),
            AnyMsg::Finalize(b) => b.encode_onto(w),
            AnyMsg::ReferenceUse(b) => b.encode_onto(w),
            AnyMsg::RemoteInterface(b) => b.encode_onto(w),
            AnyMsg::CodebaseUpdate(b) => b.encode_onto(w),
            AnyMsg::Interruption(b) => b.encode_onto(w),
        }
    }

    /// Decode a message body from a reader, according to a specified
    /// command value.  The reader must be truncated to the exact length
    /// of the body.
    pub fn decode_from_reader(cmd: MsgCmd, r: &mut Reader<'_>) -> rmi_bytes::Result<Self> {
        Ok(match cmd {
            MsgCmd::INVOCATION => AnyMsg::Invocation(Invocation::decode_from_reader(r)?),
            MsgCmd::RETURN => AnyMsg::Return(Return::decode_from_reader(r)?),
            MsgCmd::NEW_REFERENCE => AnyMsg::NewReference(NewReference::decode_from_reader(r)?),
            MsgCmd::FINALIZE => AnyMsg::Finalize(Finalize::decode_from_reader(r)?),
            MsgCmd::REFERENCE_USE => AnyMsg::ReferenceUse(ReferenceUse::decode_from_reader(r)?),
            MsgCmd::REMOTE_INTERFACE => {
                AnyMsg::RemoteInterface(RemoteInterface::decode_from_reader(r)?)
            }
            MsgCmd::CODEBASE_UPDATE => {
                AnyMsg::CodebaseUpdate(CodebaseUpdate::decode_from_reader(r)?)
            }
            MsgCmd::INTERRUPTION => AnyMsg::Interruption(Interruption::decode_from_reader(r)?),
            _ => {
                return Err(rmi_bytes::Error::InvalidMessage(
                    "unrecognized message command".into(),
                ))
            }
        })
    }
}

/// Generate `From` implementations to lift each message into [`AnyMsg`].
macro_rules! msg_into_any {
    { $($body:ident),* $(,)? } => {
        $(
            impl From<$body> for AnyMsg {
                fn from(body: $body) -> Self {
                    AnyMsg::$body(body)
                }
            }
        )*
    }
}

msg_into_any! {
    Invocation,
    Return,
    NewReference,
    Finalize,
    ReferenceUse,
    RemoteInterface,
    CodebaseUpdate,
    Interruption,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rmi_bytes::Reader;

    /// Encode `msg`'s body and decode it again under the same command.
    fn body_roundtrip(msg: AnyMsg) -> AnyMsg {
        let cmd = msg.cmd();
        let mut buf: Vec<u8> = Vec::new();
        msg.encode_onto(&mut buf).unwrap();
        let mut r = Reader::from_slice(&buf[..]);
        let out = AnyMsg::decode_from_reader(cmd, &mut r).unwrap();
        r.should_be_exhausted().unwrap();
        out
    }

    #[test]
    fn invocation() {
        let inv = Invocation::new(
            7,
            "svc".into(),
            "tell_time",
            vec!["str".into()],
            vec![Value::Str("utc".into())],
            false,
        );
        assert_eq!(inv.id(), 7);
        assert_eq!(inv.method(), "tell_time");
        assert!(!inv.is_asynchronous());

        let msg: AnyMsg = inv.clone().into();
        assert_eq!(msg.cmd(), MsgCmd::INVOCATION);
        assert_eq!(body_roundtrip(msg), AnyMsg::Invocation(inv));
    }

    #[test]
    fn return_ok_and_err() {
        let ok = Return::new(7, Some("str".into()), Ok(Value::Str("noon".into())));
        assert_eq!(body_roundtrip(ok.clone().into()), AnyMsg::Return(ok));

        let err = Return::new(8, None, Err(Fault::new("NoSuchMethod", "tell_time")));
        assert_eq!(body_roundtrip(err.clone().into()), AnyMsg::Return(err));

        // An unknown outcome discriminant is rejected.
        let mut buf: Vec<u8> = Vec::new();
        buf.write_u64(9);
        buf.write(&false).unwrap();
        buf.write_u8(7);
        let mut r = Reader::from_slice(&buf[..]);
        assert!(AnyMsg::decode_from_reader(MsgCmd::RETURN, &mut r).is_err());
    }

    #[test]
    fn dgc_notices() {
        let m: AnyMsg = NewReference::new("###1").into();
        assert_eq!(m.cmd(), MsgCmd::NEW_REFERENCE);
        let m = body_roundtrip(m);
        assert!(matches!(m, AnyMsg::NewReference(n) if n.object_id().as_str() == "###1"));

        let m = body_roundtrip(Finalize::new("###1").into());
        assert!(matches!(m, AnyMsg::Finalize(_)));

        let m = body_roundtrip(ReferenceUse::new("svc").into());
        assert!(matches!(m, AnyMsg::ReferenceUse(_)));
    }

    #[test]
    fn remote_interface_request_response() {
        let req = RemoteInterface::request(3, "svc".into());
        assert!(req.interfaces().is_none());
        assert_eq!(body_roundtrip(req.clone().into()), AnyMsg::RemoteInterface(req));

        let resp = RemoteInterface::response(3, "svc".into(), vec!["demo.Clock".into()]);
        assert_eq!(resp.interfaces().unwrap(), &["demo.Clock".to_owned()][..]);
        assert_eq!(
            body_roundtrip(resp.clone().into()),
            AnyMsg::RemoteInterface(resp)
        );
    }

    #[test]
    fn codebase_update_dedups() {
        let m = CodebaseUpdate::new(vec![
            "https://a.example/jar".to_owned(),
            "https://a.example/jar".to_owned(),
            "https://b.example/jar".to_owned(),
        ]);
        assert_eq!(m.urls().len(), 2);
        assert_eq!(body_roundtrip(m.clone().into()), AnyMsg::CodebaseUpdate(m));
    }

    #[test]
    fn interruption() {
        let m = Interruption::new(99);
        assert_eq!(m.id(), 99);
        assert_eq!(body_roundtrip(m.clone().into()), AnyMsg::Interruption(m));
    }

    #[test]
    fn cmd_display() {
        assert_eq!(MsgCmd::INVOCATION.to_string(), "INVOCATION");
        assert_eq!(MsgCmd::from(200).to_string(), "UNRECOGNIZED(200)");
    }
}
