//! Wrap rmi_msg::codec::FrameCodec for use with the futures_codec
//! crate.
use std::io::Error as IoError;

use rmi_msg::codec::FrameCodec;
use rmi_msg::msg::AnyMsg;

use asynchronous_codec as futures_codec;
use bytes::BytesMut;

/// An error from a MsgCodec.
///
/// This is a separate error type because the rest of the channel code
/// wants to handle io problems and malformed frames differently.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CodecError {
    /// An error from the underlying IO stream underneath a codec.
    #[error("io error reading or writing a message frame")]
    Io(#[from] IoError),
    /// An error from the frame decoding logic.
    #[error("error decoding an incoming message frame")]
    Dec(#[source] rmi_msg::Error),
    /// An error from the frame encoding logic.
    #[error("error encoding an outgoing message frame")]
    Enc(#[source] rmi_msg::Error),
}

impl From<CodecError> for crate::Error {
    fn from(err: CodecError) -> crate::Error {
        use std::sync::Arc;
        match err {
            CodecError::Io(e) => crate::Error::ChanIoErr(Arc::new(e)),
            CodecError::Dec(e) | CodecError::Enc(e) => crate::Error::Codec(e),
        }
    }
}

/// Asynchronous wrapper around FrameCodec in rmi_msg, with implementation
/// for use with futures_codec.
///
/// This type lets us wrap any AsyncRead+AsyncWrite type as a Sink and a
/// Stream of AnyMsg, so we can forget about byte-oriented communication.
pub(crate) struct MsgCodec(FrameCodec);

impl MsgCodec {
    /// Create a new MsgCodec.
    pub(crate) fn new() -> Self {
        MsgCodec(FrameCodec::new())
    }
}

impl futures_codec::Encoder for MsgCodec {
    type Item<'a> = AnyMsg;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.write_msg(item, dst).map_err(CodecError::Enc)?;
        Ok(())
    }
}

impl futures_codec::Decoder for MsgCodec {
    type Item = AnyMsg;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.0.decode_msg(src).map_err(CodecError::Dec)
    }
}

#[cfg(test)]
pub(crate) mod test {
    #![allow(clippy::unwrap_used)]
    use futures::io::{AsyncRead, AsyncWrite, Cursor, Result};
    use futures::sink::SinkExt;
    use futures::stream::StreamExt;
    use futures::task::{Context, Poll};
    use std::pin::Pin;

    use super::{futures_codec, MsgCodec};
    use rmi_msg::msg::{AnyMsg, Interruption, NewReference};

    /// Helper type for reading and writing bytes to/from buffers.
    pub(crate) struct MsgBuf {
        /// Data we have received as a reader.
        inbuf: futures::io::Cursor<Vec<u8>>,
        /// Data we write as a writer.
        outbuf: futures::io::Cursor<Vec<u8>>,
    }

    impl AsyncRead for MsgBuf {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<Result<usize>> {
            Pin::new(&mut self.inbuf).poll_read(cx, buf)
        }
    }
    impl AsyncWrite for MsgBuf {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<Result<usize>> {
            Pin::new(&mut self.outbuf).poll_write(cx, buf)
        }
        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
            Pin::new(&mut self.outbuf).poll_flush(cx)
        }
        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
            Pin::new(&mut self.outbuf).poll_close(cx)
        }
    }

    impl MsgBuf {
        pub(crate) fn new<T: Into<Vec<u8>>>(output: T) -> Self {
            let inbuf = Cursor::new(output.into());
            let outbuf = Cursor::new(Vec::new());
            MsgBuf { inbuf, outbuf }
        }

        pub(crate) fn consumed(&self) -> usize {
            self.inbuf.position() as usize
        }

        pub(crate) fn all_consumed(&self) -> bool {
            self.inbuf.get_ref().len() == self.consumed()
        }

        pub(crate) fn into_response(self) -> Vec<u8> {
            self.outbuf.into_inner()
        }
    }

    fn frame_buf(mbuf: MsgBuf) -> futures_codec::Framed<MsgBuf, MsgCodec> {
        futures_codec::Framed::new(mbuf, MsgCodec::new())
    }

    #[tokio::test]
    async fn check_encoding() {
        let mb = MsgBuf::new(&b""[..]);
        let mut framed = frame_buf(mb);

        framed
            .send(NewReference::new("###1").into())
            .await
            .unwrap();
        framed.send(Interruption::new(5).into()).await.unwrap();
        framed.flush().await.unwrap();

        let data = framed.into_inner().into_response();

        // cmd=3, len=6, "###1" with its u16 length prefix.
        assert_eq!(
            &data[0..11],
            &[0x03, 0, 0, 0, 6, 0, 4, b'#', b'#', b'#', b'1']
        );
        // cmd=8, len=8, the u64 invocation id.
        assert_eq!(&data[11..], &[0x08, 0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 5]);
    }

    #[tokio::test]
    async fn check_decoding() {
        let mut dat = Vec::new();
        dat.extend_from_slice(&[0x03, 0, 0, 0, 6, 0, 4, b'#', b'#', b'#', b'1']);
        dat.extend_from_slice(&[0x08, 0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 5]);
        let mb = MsgBuf::new(&dat[..]);
        let mut framed = frame_buf(mb);

        let newref = framed.next().await.unwrap().unwrap();
        let intr = framed.next().await.unwrap().unwrap();

        assert!(matches!(newref, AnyMsg::NewReference(n) if n.object_id().as_str() == "###1"));
        assert!(matches!(intr, AnyMsg::Interruption(i) if i.id() == 5));

        assert!(framed.into_inner().all_consumed());
    }
}
