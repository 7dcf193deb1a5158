use std::{
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::Path,
};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    CharDevice,
    BlockDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustPolicy {
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    /// Any of these mode bits set rejects the file.
    pub forbidden: u32,
    /// All of these mode bits must be set.
    pub required: u32,
}

impl TrustPolicy {
    pub fn executable(uid: u32, gid: u32) -> Self {
        TrustPolicy { kind: FileKind::Regular, uid, gid, forbidden: 0o022, required: 0o111 }
    }

    pub fn readable(uid: u32, gid: u32) -> Self {
        TrustPolicy { kind: FileKind::Regular, uid, gid, forbidden: 0o022, required: 0o444 }
    }

    pub fn device(uid: u32, gid: u32) -> Self {
        TrustPolicy { kind: FileKind::CharDevice, uid, gid, forbidden: 0o007, required: 0o600 }
    }
}

/// Checks `path` against `policy`. Every failure, including a missing file,
/// yields the same `Error::Untrusted`.
pub fn verify(path: &Path, policy: &TrustPolicy) -> Result<(), Error> {
    let untrusted = || Error::Untrusted(path.to_path_buf());
    let metadata = std::fs::metadata(path).map_err(|_| untrusted())?;

    let file_type = metadata.file_type();
    let kind_ok = match policy.kind {
        FileKind::Regular => file_type.is_file(),
        FileKind::CharDevice => file_type.is_char_device(),
        FileKind::BlockDevice => file_type.is_block_device(),
    };
    if !kind_ok {
        log::debug!("{:?}: expected {:?}", path, policy.kind);
        return Err(untrusted());
    }

    if metadata.uid() != policy.uid || metadata.gid() != policy.gid {
        log::debug!("{:?}: owned by {}:{}, expected {}:{}", path, metadata.uid(), metadata.gid(), policy.uid, policy.gid);
        return Err(untrusted());
    }

    let mode = metadata.mode() & 0o7777;
    if mode & policy.forbidden != 0 || mode & policy.required != policy.required {
        log::debug!("{:?}: mode {:o} rejected", path, mode);
        return Err(untrusted());
    }
    Ok(())
}
