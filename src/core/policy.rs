// src/core/policy.rs

//! The external policy callout. A registered hook advertises the request
//! kinds it wants to see; for each claimed request the hook owns the
//! reply and the built-in handling is skipped.

use async_trait::async_trait;
use bitflags::bitflags;

bitflags! {
    /// Request kinds a policy hook may claim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PolicyCaps: u32 {
        const CHMOD  = 1 << 0;
        const MKDIR  = 1 << 1;
        const MKPATH = 1 << 2;
        const MV     = 1 << 3;
        const RM     = 1 << 4;
        const RMDIR  = 1 << 5;
        const PREP   = 1 << 6;
        const SELECT = 1 << 7;
        const STAT   = 1 << 8;
    }
}

/// The request view handed to a hook.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub cap: PolicyCaps,
    pub streamid: u16,
    pub path: &'a str,
    pub path2: Option<&'a str>,
    pub mode: Option<&'a str>,
    pub opaque: &'a str,
}

/// Whether the hook took ownership of the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Claimed,
    Declined,
}

#[async_trait]
pub trait PolicyHook: Send + Sync {
    /// The request kinds this hook wants offered.
    fn caps(&self) -> PolicyCaps;

    /// Offered a matching request; `Claimed` means the hook replied (or
    /// chose to drop it) and dispatch must not.
    async fn claim(&self, req: PolicyRequest<'_>) -> PolicyVerdict;
}
