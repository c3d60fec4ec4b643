// src/core/protocol/frame.rs

//! Implements the framed peer-link wire format and the corresponding
//! `Encoder` and `Decoder` for network communication.
//!
//! Every message is a fixed six-byte header followed by `datalen` payload
//! bytes: `{streamid: u16 BE, code: u8, modifier: u8, datalen: u16 BE}`.

use crate::core::CmsError;
use crate::core::protocol::codes::ReqCode;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header.
pub const HDR_LEN: usize = 6;

/// A single message on a peer link.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub streamid: u16,
    pub code: ReqCode,
    pub modifier: u8,
    pub data: Bytes,
}

impl Frame {
    pub fn new(code: ReqCode, streamid: u16, modifier: u8, data: Bytes) -> Self {
        Frame {
            streamid,
            code,
            modifier,
            data,
        }
    }

    /// A frame with an empty payload (ping, pong, disc, update, usage...).
    pub fn bare(code: ReqCode, streamid: u16, modifier: u8) -> Self {
        Frame::new(code, streamid, modifier, Bytes::new())
    }

    /// A `wait` response telling the requester to retry after `seconds`.
    pub fn wait(streamid: u16, seconds: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(seconds);
        Frame::new(ReqCode::Wait, streamid, 0, buf.freeze())
    }

    /// An `error` response carrying a wire errno and a human message.
    pub fn error(streamid: u16, errno: u32, msg: &str) -> Self {
        let mut buf = BytesMut::with_capacity(4 + msg.len() + 1);
        buf.put_u32(errno);
        buf.put_slice(msg.as_bytes());
        buf.put_u8(0);
        Frame::new(ReqCode::Error, streamid, 0, buf.freeze())
    }

    /// A `redirect` response pointing the client at `host:port`.
    pub fn redirect(streamid: u16, port: u16, host: &str) -> Self {
        let mut buf = BytesMut::with_capacity(4 + host.len());
        buf.put_u32(port as u32);
        buf.put_slice(host.as_bytes());
        Frame::new(ReqCode::Redirect, streamid, 0, buf.freeze())
    }

    /// A `data` response whose payload starts with a leading u32 result
    /// value followed by raw text (locate lists, statfs lines, stats).
    pub fn data(streamid: u16, val: u32, text: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(4 + text.len() + 1);
        buf.put_u32(val);
        buf.put_slice(text);
        buf.put_u8(0);
        Frame::new(ReqCode::Data, streamid, 0, buf.freeze())
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut codec = CmsFrameCodec;
        codec
            .encode(self.clone(), &mut buf)
            .expect("header encoding is infallible");
        buf.to_vec()
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding frames.
#[derive(Debug, Default)]
pub struct CmsFrameCodec;

impl Decoder for CmsFrameCodec {
    type Item = Frame;
    type Error = CmsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HDR_LEN {
            return Ok(None);
        }

        let datalen = u16::from_be_bytes([src[4], src[5]]) as usize;
        if src.len() < HDR_LEN + datalen {
            // Wait for the rest of the payload.
            src.reserve(HDR_LEN + datalen - src.len());
            return Ok(None);
        }

        let streamid = src.get_u16();
        let rr_code = src.get_u8();
        let modifier = src.get_u8();
        let _ = src.get_u16();
        let data = src.split_to(datalen).freeze();

        let code = ReqCode::from_u8(rr_code)
            .ok_or_else(|| CmsError::BadRequest(format!("unknown request code {rr_code}")))?;

        Ok(Some(Frame {
            streamid,
            code,
            modifier,
            data,
        }))
    }
}

impl Encoder<Frame> for CmsFrameCodec {
    type Error = CmsError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.data.len() > u16::MAX as usize {
            return Err(CmsError::BadRequest(format!(
                "payload of {} bytes exceeds the frame limit",
                item.data.len()
            )));
        }
        dst.reserve(HDR_LEN + item.data.len());
        dst.put_u16(item.streamid);
        dst.put_u8(item.code as u8);
        dst.put_u8(item.modifier);
        dst.put_u16(item.data.len() as u16);
        dst.put_slice(&item.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_header_yields_none() {
        let mut codec = CmsFrameCodec;
        let mut buf = BytesMut::from(&[0u8, 1, 2][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let mut codec = CmsFrameCodec;
        let frame = Frame::new(ReqCode::Have, 7, 2, Bytes::from_static(b"\x00\x04/a/x"));
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut codec = CmsFrameCodec;
        let mut buf = BytesMut::from(&[0u8, 1, 0xEE, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CmsError::BadRequest(_))
        ));
    }
}
