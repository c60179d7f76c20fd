//! Filesystem probes used by the file dependency tracer.

use std::io;
use std::os::unix::prelude::MetadataExt;
use std::path::Path;

/// MTime info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MTime {
    Missing,
    /// Nanoseconds since the epoch.  Full precision matters: the digest
    /// cache treats an unchanged stamp as proof of unchanged content.
    Stamp(i64),
}

/// stat() an on-disk path, producing its MTime.
pub fn stat(path: &Path) -> io::Result<MTime> {
    Ok(match std::fs::metadata(path) {
        Ok(meta) => MTime::Stamp(meta.mtime() * 1_000_000_000 + meta.mtime_nsec()),
        Err(err) => {
            if err.kind() == io::ErrorKind::NotFound {
                MTime::Missing
            } else {
                return Err(err);
            }
        }
    })
}
