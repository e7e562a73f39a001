//! Free disk space probing for the pull guard.

use std::io;
use std::path::Path;

use nix::sys::statvfs::statvfs;

/// Bytes in one GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Source of free-space measurements.
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by `statvfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskSpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let stat = statvfs(path).map_err(io::Error::from)?;

        #[allow(clippy::unnecessary_cast)]
        let available =
            (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
        Ok(available)
    }
}

/// Probe reporting a fixed amount, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub u64);

impl DiskSpaceProbe for FixedProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statvfs_root() {
        let available = StatvfsProbe.available_bytes(Path::new("/")).unwrap();
        // Any mounted root reports something.
        assert!(available < u64::MAX);
    }

    #[test]
    fn test_statvfs_missing_path() {
        let err = StatvfsProbe
            .available_bytes(Path::new("/definitely/not/a/real/path"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_fixed_probe() {
        assert_eq!(
            FixedProbe(5 * GIB).available_bytes(Path::new("/")).unwrap(),
            5 * GIB
        );
    }
}
