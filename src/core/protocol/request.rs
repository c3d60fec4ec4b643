// src/core/protocol/request.rs

//! The decoded request envelope and the packed-string payload helpers.
//!
//! Strings inside a frame payload are packed as a `u16` BE length followed
//! by that many bytes, in a fixed per-code order. Numeric payload fields
//! are `u32`/`u64` BE values.

use crate::core::CmsError;
use crate::core::protocol::codes::ReqCode;
use crate::core::protocol::frame::Frame;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Append one packed string to `buf`.
pub fn pack_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Remove one packed string from the front of `buf`.
pub fn unpack_str(buf: &mut Bytes) -> Result<String, CmsError> {
    if buf.len() < 2 {
        return Err(CmsError::IncompleteData);
    }
    let len = buf.get_u16() as usize;
    if buf.len() < len {
        return Err(CmsError::IncompleteData);
    }
    let raw = buf.split_to(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

fn unpack_u32(buf: &mut Bytes) -> Result<u32, CmsError> {
    if buf.len() < 4 {
        return Err(CmsError::IncompleteData);
    }
    Ok(buf.get_u32())
}

/// One exported path declared at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDecl {
    pub path: String,
    pub write: bool,
    pub stage: bool,
}

impl ExportDecl {
    const FLAG_WRITE: u8 = 1 << 0;
    const FLAG_STAGE: u8 = 1 << 1;
}

/// The decoded request envelope: every field any `do_*` handler may need,
/// populated according to the request code.
#[derive(Debug, Clone, Default)]
pub struct RRData {
    pub streamid: u16,
    pub modifier: u8,
    pub path: String,
    pub path2: String,
    pub mode: String,
    pub opaque: String,
    pub reqid: String,
    pub notify: String,
    pub prty: String,
    /// Host the requester wants excluded from selection, if any.
    pub avoid: Option<String>,
    pub dsk_free: u64,
    pub dsk_util: u32,
    /// cpu, net, xeq, mem, pag, dsk percent loads.
    pub loads: [u8; 6],
    pub nid: String,
    pub port: u16,
    pub exports: Vec<ExportDecl>,
    pub hosts: Vec<String>,
}

impl RRData {
    /// Decodes a frame's payload into the envelope. The raw frame stays
    /// available to handlers that rebroadcast it verbatim.
    pub fn decode(frame: &Frame) -> Result<RRData, CmsError> {
        let mut arg = RRData {
            streamid: frame.streamid,
            modifier: frame.modifier,
            ..RRData::default()
        };
        let mut buf = frame.data.clone();

        match frame.code {
            ReqCode::Login => {
                arg.nid = unpack_str(&mut buf)?;
                arg.port = unpack_u32(&mut buf)? as u16;
                arg.dsk_free = unpack_u32(&mut buf)? as u64;
                arg.dsk_util = unpack_u32(&mut buf)?;
                let count = unpack_u32(&mut buf)? as usize;
                for _ in 0..count {
                    if buf.is_empty() {
                        return Err(CmsError::IncompleteData);
                    }
                    let flags = buf.get_u8();
                    let path = unpack_str(&mut buf)?;
                    arg.exports.push(ExportDecl {
                        path,
                        write: flags & ExportDecl::FLAG_WRITE != 0,
                        stage: flags & ExportDecl::FLAG_STAGE != 0,
                    });
                }
            }
            ReqCode::Avail => {
                arg.dsk_free = unpack_u32(&mut buf)? as u64;
                arg.dsk_util = unpack_u32(&mut buf)?;
            }
            ReqCode::Load => {
                if buf.len() < 6 {
                    return Err(CmsError::IncompleteData);
                }
                buf.copy_to_slice(&mut arg.loads);
                arg.dsk_free = unpack_u32(&mut buf)? as u64;
            }
            ReqCode::Have | ReqCode::Gone | ReqCode::State | ReqCode::StatFs | ReqCode::Rm
            | ReqCode::Rmdir | ReqCode::Locate => {
                arg.path = unpack_str(&mut buf)?;
                if !buf.is_empty() {
                    arg.opaque = unpack_str(&mut buf)?;
                }
            }
            ReqCode::Select => {
                arg.path = unpack_str(&mut buf)?;
                arg.opaque = unpack_str(&mut buf)?;
                if !buf.is_empty() {
                    let avoid = unpack_str(&mut buf)?;
                    if !avoid.is_empty() {
                        arg.avoid = Some(avoid);
                    }
                }
            }
            ReqCode::Chmod | ReqCode::Mkdir | ReqCode::Mkpath => {
                arg.mode = unpack_str(&mut buf)?;
                arg.path = unpack_str(&mut buf)?;
            }
            ReqCode::Mv => {
                arg.path = unpack_str(&mut buf)?;
                arg.path2 = unpack_str(&mut buf)?;
            }
            ReqCode::PrepAdd => {
                arg.reqid = unpack_str(&mut buf)?;
                arg.notify = unpack_str(&mut buf)?;
                arg.prty = unpack_str(&mut buf)?;
                arg.mode = unpack_str(&mut buf)?;
                arg.path = unpack_str(&mut buf)?;
            }
            ReqCode::PrepDel => {
                arg.reqid = unpack_str(&mut buf)?;
            }
            ReqCode::Try => {
                let list = unpack_str(&mut buf)?;
                arg.hosts = list.split_whitespace().map(str::to_owned).collect();
            }
            // Bare requests and response codes carry no envelope fields.
            _ => {}
        }

        Ok(arg)
    }
}

// --- Frame builders for requests this node originates ---

#[allow(clippy::too_many_arguments)]
pub fn login_frame(
    streamid: u16,
    modifier: u8,
    nid: &str,
    port: u16,
    free_mb: u64,
    util: u32,
    exports: &[ExportDecl],
) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, nid);
    buf.put_u32(port as u32);
    buf.put_u32(free_mb.min(u32::MAX as u64) as u32);
    buf.put_u32(util);
    buf.put_u32(exports.len() as u32);
    for e in exports {
        let mut flags = 0u8;
        if e.write {
            flags |= ExportDecl::FLAG_WRITE;
        }
        if e.stage {
            flags |= ExportDecl::FLAG_STAGE;
        }
        buf.put_u8(flags);
        pack_str(&mut buf, &e.path);
    }
    Frame::new(ReqCode::Login, streamid, modifier, buf.freeze())
}

pub fn path_frame(code: ReqCode, streamid: u16, modifier: u8, path: &str) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, path);
    Frame::new(code, streamid, modifier, buf.freeze())
}

pub fn select_frame(
    streamid: u16,
    modifier: u8,
    path: &str,
    opaque: &str,
    avoid: Option<&str>,
) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, path);
    pack_str(&mut buf, opaque);
    if let Some(host) = avoid {
        pack_str(&mut buf, host);
    }
    Frame::new(ReqCode::Select, streamid, modifier, buf.freeze())
}

pub fn mode_frame(code: ReqCode, streamid: u16, mode: &str, path: &str) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, mode);
    pack_str(&mut buf, path);
    Frame::new(code, streamid, 0, buf.freeze())
}

pub fn mv_frame(streamid: u16, old_path: &str, new_path: &str) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, old_path);
    pack_str(&mut buf, new_path);
    Frame::new(ReqCode::Mv, streamid, 0, buf.freeze())
}

pub fn avail_frame(streamid: u16, free_mb: u64, util: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(free_mb.min(u32::MAX as u64) as u32);
    buf.put_u32(util);
    Frame::new(ReqCode::Avail, streamid, 0, buf.freeze())
}

pub fn load_frame(streamid: u16, loads: [u8; 6], free_mb: u64) -> Frame {
    let mut buf = BytesMut::with_capacity(10);
    buf.put_slice(&loads);
    buf.put_u32(free_mb.min(u32::MAX as u64) as u32);
    Frame::new(ReqCode::Load, streamid, 0, buf.freeze())
}

pub fn prep_add_frame(
    streamid: u16,
    modifier: u8,
    reqid: &str,
    notify: &str,
    prty: &str,
    mode: &str,
    path: &str,
) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, reqid);
    pack_str(&mut buf, notify);
    pack_str(&mut buf, prty);
    pack_str(&mut buf, mode);
    pack_str(&mut buf, path);
    Frame::new(ReqCode::PrepAdd, streamid, modifier, buf.freeze())
}

pub fn prep_del_frame(streamid: u16, reqid: &str) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, reqid);
    Frame::new(ReqCode::PrepDel, streamid, 0, buf.freeze())
}

pub fn try_frame(streamid: u16, hosts: &[String]) -> Frame {
    let mut buf = BytesMut::new();
    pack_str(&mut buf, &hosts.join(" "));
    Frame::new(ReqCode::Try, streamid, 0, buf.freeze())
}
