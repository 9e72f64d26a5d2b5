//! The opaque POSIX metadata record stored with every file tree item.
//!
//! Fixed little-endian layout, symlink target appended for links:
//!
//! ```text
//! mode: u32  uid: u32  gid: u32  rdev: u64  size: u64
//! mtime_sec: i64  mtime_nsec: u32  link_target: [u8]
//! ```
//!
//! Access time is deliberately not recorded; the backup engine's "file
//! unchanged" test compares everything this record holds.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use crate::error::{bad_format, io_err};

const FIXED_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub link_target: Vec<u8>,
}

impl ItemMetadata {
    /// Capture the metadata of a path without following symlinks.
    pub fn capture(path: &Path) -> Result<Self, Error> {
        let stat = nix::sys::stat::lstat(path)
            .map_err(|err| io_err(format!("unable to stat {:?}", path), err.into()))?;

        let mut meta = Self {
            mode: stat.st_mode,
            uid: stat.st_uid,
            gid: stat.st_gid,
            rdev: stat.st_rdev,
            size: stat.st_size as u64,
            mtime_sec: stat.st_mtime,
            mtime_nsec: stat.st_mtime_nsec as u32,
            link_target: Vec::new(),
        };
        if meta.is_symlink() {
            let target = std::fs::read_link(path)
                .map_err(|err| io_err(format!("unable to read link {:?}", path), err))?;
            meta.link_target = target.as_os_str().as_bytes().to_vec();
            meta.size = meta.link_target.len() as u64;
        }
        Ok(meta)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_device(&self) -> bool {
        matches!(self.mode & libc::S_IFMT, libc::S_IFBLK | libc::S_IFCHR)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_SIZE + self.link_target.len());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.rdev.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.mtime_sec.to_le_bytes());
        out.extend_from_slice(&self.mtime_nsec.to_le_bytes());
        out.extend_from_slice(&self.link_target);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < FIXED_SIZE {
            return Err(bad_format(format!(
                "file metadata record too small ({} bytes)",
                data.len()
            )));
        }
        Ok(Self {
            mode: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            uid: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            gid: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            rdev: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            size: u64::from_le_bytes(data[20..28].try_into().unwrap()),
            mtime_sec: i64::from_le_bytes(data[28..36].try_into().unwrap()),
            mtime_nsec: u32::from_le_bytes(data[36..40].try_into().unwrap()),
            link_target: data[FIXED_SIZE..].to_vec(),
        })
    }

    /// The backup engine's "unchanged" test: everything but access time.
    pub fn similar(&self, other: &Self) -> bool {
        self == other
    }

    /// Apply ownership, permissions and mtime to a restored path.
    ///
    /// Ownership first (it may strip our own access), then the mode, then
    /// the timestamp, so the mtime survives the other changes.
    pub fn apply(&self, path: &Path) -> Result<(), Error> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| format_err!("path {:?} contains a NUL byte", path))?;

        let res = unsafe { libc::lchown(c_path.as_ptr(), self.uid, self.gid) };
        if res != 0 {
            let err = std::io::Error::last_os_error();
            // unprivileged restores cannot chown; that is a warning upstream
            bail!("failed to set ownership of {:?} - {}", path, err);
        }

        if !self.is_symlink() {
            let res = unsafe { libc::chmod(c_path.as_ptr(), self.mode as libc::mode_t & 0o7777) };
            if res != 0 {
                bail!(
                    "failed to set mode of {:?} - {}",
                    path,
                    std::io::Error::last_os_error()
                );
            }
        }

        self.apply_mtime(path)?;
        Ok(())
    }

    /// Restore only the modification time (access time is left untouched).
    pub fn apply_mtime(&self, path: &Path) -> Result<(), Error> {
        const UTIME_OMIT: i64 = (1 << 30) - 2;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| format_err!("path {:?} contains a NUL byte", path))?;
        let times = [
            libc::timespec {
                tv_sec: 0,
                tv_nsec: UTIME_OMIT,
            },
            libc::timespec {
                tv_sec: self.mtime_sec,
                tv_nsec: self.mtime_nsec as i64,
            },
        ];
        let res = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if res != 0 {
            bail!(
                "failed to restore mtime of {:?} - {}",
                path,
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }
}

/// Copy one file's mtime onto another (used to pair the ciphered index
/// with its clear cache).
pub fn copy_mtime(from: &Path, to: &Path) -> Result<(), Error> {
    let stat = nix::sys::stat::stat(from)
        .map_err(|err| format_err!("unable to stat {:?} - {}", from, err))?;
    let meta = ItemMetadata {
        mode: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        size: 0,
        mtime_sec: stat.st_mtime,
        mtime_nsec: stat.st_mtime_nsec as u32,
        link_target: Vec::new(),
    };
    meta.apply_mtime(to)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let meta = ItemMetadata {
            mode: libc::S_IFLNK | 0o777,
            uid: 1000,
            gid: 100,
            rdev: 0,
            size: 9,
            mtime_sec: 1_700_000_000,
            mtime_nsec: 123_456_789,
            link_target: b"some/file".to_vec(),
        };
        let encoded = meta.encode();
        let decoded = ItemMetadata::decode(&encoded).unwrap();
        assert_eq!(decoded, meta);
        assert!(decoded.is_symlink());
        assert!(!decoded.is_file());

        assert!(ItemMetadata::decode(&encoded[..10]).is_err());
    }

    #[test]
    fn capture_sees_through_nothing() -> Result<(), Error> {
        let dir = std::env::temp_dir().join(format!("frost-meta-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let file = dir.join("plain.txt");
        std::fs::write(&file, b"twelve bytes")?;

        let meta = ItemMetadata::capture(&file)?;
        assert!(meta.is_file());
        assert_eq!(meta.size, 12);

        let link = dir.join("link");
        let _ = std::fs::remove_file(&link);
        std::os::unix::fs::symlink("plain.txt", &link)?;
        let link_meta = ItemMetadata::capture(&link)?;
        assert!(link_meta.is_symlink());
        assert_eq!(link_meta.link_target, b"plain.txt");

        let again = ItemMetadata::capture(&file)?;
        assert!(meta.similar(&again));

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
