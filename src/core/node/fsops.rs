// src/core/node/fsops.rs

//! Local file-system mutations on behalf of forwarded write-path
//! requests: either the configured external program runs with the mode
//! and path arguments, or the direct call is made. ENOENT is swallowed
//! for removals and mode changes; other failures come back as the
//! errno's message.

use crate::config::FsConfig;
use crate::core::CmsError;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// The mutation kinds a data peer executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Chmod,
    Mkdir,
    Mkpath,
    Mv,
    Rm,
    Rmdir,
}

impl FsOp {
    fn program<'a>(self, cfg: &'a FsConfig) -> Option<&'a str> {
        match self {
            FsOp::Chmod => cfg.prog_chmod.as_deref(),
            FsOp::Mkdir => cfg.prog_mkdir.as_deref(),
            FsOp::Mkpath => cfg.prog_mkpath.as_deref(),
            FsOp::Mv => cfg.prog_mv.as_deref(),
            FsOp::Rm => cfg.prog_rm.as_deref(),
            FsOp::Rmdir => cfg.prog_rmdir.as_deref(),
        }
    }

    /// Removals and mode changes of something already absent succeed.
    fn ignores_enoent(self) -> bool {
        matches!(self, FsOp::Chmod | FsOp::Rm | FsOp::Rmdir)
    }
}

/// Translates a logical file name to the physical path by the configured
/// prefix remap.
pub fn lfn2pfn(cfg: &FsConfig, path: &str) -> Result<PathBuf, CmsError> {
    match &cfg.n2n {
        None => Ok(PathBuf::from(path)),
        Some(n2n) => match path.strip_prefix(&n2n.lfn_prefix) {
            Some(rest) => Ok(PathBuf::from(format!("{}{}", n2n.pfn_prefix, rest))),
            None => Err(CmsError::BadRequest(format!(
                "lfn2pfn failed for {path}"
            ))),
        },
    }
}

/// Parses an octal permission string; anything above 0o777 is invalid.
pub fn parse_mode(mode: &str) -> Option<u32> {
    let bits = u32::from_str_radix(mode, 8).ok()?;
    if bits == 0 || bits >> 9 != 0 {
        return None;
    }
    Some(bits)
}

/// Executes one mutation, via the configured program when present.
pub async fn run(
    cfg: &FsConfig,
    op: FsOp,
    mode: Option<&str>,
    path: &str,
    path2: Option<&str>,
) -> Result<(), CmsError> {
    let pfn = lfn2pfn(cfg, path)?;
    let pfn2 = path2.map(|p| lfn2pfn(cfg, p)).transpose()?;

    let result = if let Some(prog) = op.program(cfg) {
        run_program(prog, mode, &pfn, pfn2.as_deref().map(|p| p.to_str().unwrap_or(""))).await
    } else {
        run_direct(op, mode, &pfn, pfn2.as_ref()).await
    };

    match result {
        Ok(()) => {
            debug!("{:?} {} ok", op, pfn.display());
            Ok(())
        }
        Err(CmsError::FsError(errno, _)) if errno == libc::ENOENT && op.ignores_enoent() => {
            debug!("{:?} {}: ENOENT ignored", op, pfn.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn run_program(
    prog: &str,
    mode: Option<&str>,
    path: &std::path::Path,
    path2: Option<&str>,
) -> Result<(), CmsError> {
    let mut cmd = Command::new(prog);
    if let Some(mode) = mode {
        cmd.arg(mode);
    }
    cmd.arg(path);
    if let Some(p2) = path2 {
        cmd.arg(p2);
    }
    let status = cmd.status().await?;
    if status.success() {
        Ok(())
    } else {
        // The program reports the errno as its exit code.
        let errno = status.code().unwrap_or(libc::EIO);
        Err(CmsError::from_errno(errno))
    }
}

async fn run_direct(
    op: FsOp,
    mode: Option<&str>,
    path: &std::path::Path,
    path2: Option<&PathBuf>,
) -> Result<(), CmsError> {
    let to_cms = |e: std::io::Error| match e.raw_os_error() {
        Some(errno) => CmsError::from_errno(errno),
        None => CmsError::Io(std::sync::Arc::new(e)),
    };
    match op {
        FsOp::Chmod => {
            use std::os::unix::fs::PermissionsExt;
            let bits = mode
                .and_then(parse_mode)
                .ok_or_else(|| CmsError::BadRequest("invalid mode".to_string()))?;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(bits))
                .await
                .map_err(to_cms)
        }
        FsOp::Mkdir => tokio::fs::create_dir(path).await.map_err(to_cms),
        FsOp::Mkpath => tokio::fs::create_dir_all(path).await.map_err(to_cms),
        FsOp::Mv => {
            let dst = path2.ok_or_else(|| CmsError::BadRequest("missing target path".into()))?;
            tokio::fs::rename(path, dst).await.map_err(to_cms)
        }
        FsOp::Rm => tokio::fs::remove_file(path).await.map_err(to_cms),
        FsOp::Rmdir => tokio::fs::remove_dir(path).await.map_err(to_cms),
    }
}

/// Checks whether a path is online on this peer's disk. Regular files
/// and directories count; a pending stage answers through the prepare
/// queue, not here.
pub async fn is_online(cfg: &FsConfig, path: &str) -> bool {
    let Ok(pfn) = lfn2pfn(cfg, path) else {
        return false;
    };
    match tokio::fs::metadata(&pfn).await {
        Ok(meta) => meta.is_file() || meta.is_dir(),
        Err(_) => false,
    }
}
