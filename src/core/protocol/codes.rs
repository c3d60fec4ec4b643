// src/core/protocol/codes.rs

//! Request/response codes and their per-code modifier bit flags.

use bitflags::bitflags;
use strum_macros::{Display, EnumString, FromRepr};

/// Every message on a peer link carries exactly one of these codes.
/// Requests and responses share the code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum ReqCode {
    Login = 1,
    Ping,
    Pong,
    Load,
    Space,
    Avail,
    Status,
    Try,
    Disc,
    Have,
    Gone,
    State,
    StatFs,
    Locate,
    Select,
    PrepAdd,
    PrepDel,
    Chmod,
    Mkdir,
    Mkpath,
    Mv,
    Rm,
    Rmdir,
    Update,
    Usage,
    Stats,
    // Response-only codes
    Wait,
    Error,
    Redirect,
    Data,
}

impl ReqCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        ReqCode::from_repr(v)
    }
}

bitflags! {
    /// Modifier flags for `Login` requests: role and initial service state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoginMod: u8 {
        const SERVER     = 1 << 0;
        const SUPERVISOR = 1 << 1;
        const MANAGER    = 1 << 2;
        const PEER       = 1 << 3;
        const PROXY      = 1 << 4;
        const NOSTAGE    = 1 << 5;
        const SUSPEND    = 1 << 6;
    }
}

bitflags! {
    /// Modifier flags for `Select` requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SelectMod: u8 {
        const REFRESH = 1 << 0;
        const WRITE   = 1 << 1;
        const CREATE  = 1 << 2;
        const TRUNC   = 1 << 3;
        const ASAP    = 1 << 4;
        const ONLINE  = 1 << 5;
        const STAT    = 1 << 6;
    }
}

bitflags! {
    /// Modifier flags for `Locate` requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocateMod: u8 {
        const REFRESH = 1 << 0;
        const ASAP    = 1 << 1;
    }
}

bitflags! {
    /// Modifier flags for `State` queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateMod: u8 {
        const REFRESH = 1 << 0;
    }
}

bitflags! {
    /// Modifier flags for `Have` advisories (and `State` replies).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HaveMod: u8 {
        const ONLINE  = 1 << 0;
        const PENDING = 1 << 1;
    }
}

bitflags! {
    /// Modifier flags for `Status` requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusMod: u8 {
        const STAGE   = 1 << 0;
        const NOSTAGE = 1 << 1;
        const SUSPEND = 1 << 2;
        const RESUME  = 1 << 3;
        const RESET   = 1 << 4;
    }
}

bitflags! {
    /// Modifier flags for `PrepAdd` requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrepMod: u8 {
        const WRITE = 1 << 0;
        const STAGE = 1 << 1;
    }
}

bitflags! {
    /// Modifier flags for `Stats` requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatsMod: u8 {
        const SIZE = 1 << 0;
    }
}
