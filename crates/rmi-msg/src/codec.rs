//! Implementation for encoding and decoding of framed messages.

use bytes::BytesMut;
use rmi_bytes::{Reader, Writer};

use crate::msg::{AnyMsg, MsgCmd};
use crate::{Error, Result};

/// Number of bytes in a frame header: one command byte plus a 32-bit
/// big-endian body length.
const HEADER_LEN: usize = 5;

/// Longest body we are willing to encode or accept, in bytes.
///
/// Inbound lengths are attacker-controlled; this bound keeps a bogus
/// header from making us buffer gigabytes before the decode fails.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// This object can be used to encode and decode framed messages.
///
/// The implemented format is:
/// ```ignore
///     u8 command;
///     u32 len;
///     u8 body[len];
/// ```
///
/// Every frame is independent: no decoder state survives from one frame
/// to the next, so a stream can be resumed after any frame boundary.
#[derive(Default)]
pub struct FrameCodec {}

impl FrameCodec {
    /// Create a new FrameCodec.
    pub fn new() -> Self {
        FrameCodec {}
    }

    /// Write the given message into the provided BytesMut object.
    pub fn write_msg(&mut self, msg: AnyMsg, dst: &mut BytesMut) -> Result<()> {
        let cmd = msg.cmd();
        dst.write_u8(cmd.into());

        let pos = dst.len();
        dst.write_u32(0);
        msg.encode_onto(dst)?;
        let len = dst.len() - pos - 4;
        if len > MAX_BODY_LEN {
            return Err(Error::FrameTooLong(len));
        }
        // go back and set the length.
        let len32 = len as u32;
        dst[pos..pos + 4].copy_from_slice(&len32.to_be_bytes());
        Ok(())
    }

    /// Try to decode a message from the provided BytesMut object.
    ///
    /// On a definite decoding error, return Err(_).  On a frame that might
    /// just be truncated, return Ok(None).
    pub fn decode_msg(&mut self, src: &mut BytesMut) -> Result<Option<AnyMsg>> {
        /// Wrap `be` as an appropriate type.
        fn wrap_err(be: rmi_bytes::Error) -> Error {
            Error::BytesErr {
                err: be,
                parsed: "framed message",
            }
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let cmd: MsgCmd = src[0].into();
        let body_len = u32::from_be_bytes(
            src[1..HEADER_LEN]
                .try_into()
                .expect("four-byte slice was not four bytes!?"),
        ) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(Error::FrameTooLong(body_len));
        }
        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        let mut r = Reader::from_bytes(&frame);
        r.advance(HEADER_LEN).map_err(wrap_err)?;
        r.truncate(body_len);
        let msg = AnyMsg::decode_from_reader(cmd, &mut r).map_err(wrap_err)?;
        r.should_be_exhausted().map_err(wrap_err)?;
        Ok(Some(msg))
    }
}
