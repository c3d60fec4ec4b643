// src/core/protocol/mod.rs

//! The framed peer-link protocol: codes, wire frames, and the decoded
//! request envelope.

pub mod codes;
pub mod frame;
pub mod request;

pub use codes::ReqCode;
pub use frame::{CmsFrameCodec, Frame};
pub use request::RRData;
