// Cross-platform filesystem shim used throughout partar.
//
// This is a thin wrapper around `std::fs` (plus a few libc calls on Unix)
// that provides platform-agnostic positional I/O, preallocation, and
// metadata operations. It allows the rest of the codebase to use filesystem
// functions without worrying about platform-specific details.
//
// * On Unix platforms, we provide helpers for POSIX permissions, owner-name
//   lookup, mtimes, and (Linux) extended attributes.
// * On Windows (and other non-Unix platforms), these helpers are no-ops.

use std::fs::File;
use std::io;
use std::path::Path;

/// Positional read: fills as much of `buf` as the file provides at
/// `offset`, returning the number of bytes read (0 at EOF).
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        file.seek_read(buf, offset)
    }
}

/// Positional read of exactly `buf.len()` bytes; errors with
/// `UnexpectedEof` if the file is shorter.
pub fn pread_exact(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        let n = pread(file, buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read at offset",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Positional write of the whole buffer at `offset`.
#[allow(unused_mut)]
pub fn pwrite_all(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let n = file.seek_write(buf, offset)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "pwrite wrote 0"));
            }
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

/// Reserve `len` bytes of disk for `file`. Best effort: file systems that
/// do not support preallocation just keep the sparse truncate.
pub fn preallocate(file: &File, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        if len == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => Ok(()),
                _ => Err(err),
            };
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, len);
        Ok(())
    }
}

/// Return POSIX mode bits if available (Unix); elsewhere a plausible
/// default derived from the readonly flag.
pub fn unix_mode(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        if meta.is_dir() {
            0o755
        } else if meta.permissions().readonly() {
            0o444
        } else {
            0o644
        }
    }
}

pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// File owner uid/gid, zero on platforms without the notion.
pub fn owner_ids(meta: &std::fs::Metadata) -> (u64, u64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (meta.uid() as u64, meta.gid() as u64)
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        (0, 0)
    }
}

/// Modification time as seconds since the epoch (0 if unavailable).
pub fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Set a path's mtime, leaving atime untouched.
pub fn set_mtime(path: &Path, secs: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        let cpath = cstring(path)?;
        let times = [
            libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            libc::timespec {
                tv_sec: secs as libc::time_t,
                tv_nsec: 0,
            },
        ];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (path, secs);
        Ok(())
    }
}

/// Create a symbolic link, replacing an existing file at `link`.
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    match std::fs::remove_file(link) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(unix)]
fn cstring(path: &Path) -> io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// Look up a user name by uid.
pub fn user_name(uid: u64) -> Option<String> {
    #[cfg(unix)]
    {
        let mut buf = vec![0u8; 4096];
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut out: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(
                uid as libc::uid_t,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut out,
            )
        };
        if rc != 0 || out.is_null() {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
        name.to_str().ok().map(str::to_owned)
    }
    #[cfg(not(unix))]
    {
        let _ = uid;
        None
    }
}

/// Look up a group name by gid.
pub fn group_name(gid: u64) -> Option<String> {
    #[cfg(unix)]
    {
        let mut buf = vec![0u8; 4096];
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut out: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrgid_r(
                gid as libc::gid_t,
                &mut grp,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut out,
            )
        };
        if rc != 0 || out.is_null() {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(grp.gr_name) };
        name.to_str().ok().map(str::to_owned)
    }
    #[cfg(not(unix))]
    {
        let _ = gid;
        None
    }
}

/// List a path's extended attributes without following symlinks.
/// Unsupported file systems and platforms report an empty list.
pub fn list_xattrs(path: &Path) -> io::Result<Vec<(String, Vec<u8>)>> {
    #[cfg(target_os = "linux")]
    {
        let cpath = cstring(path)?;
        let len = unsafe { libc::llistxattr(cpath.as_ptr(), std::ptr::null_mut(), 0) };
        if len < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EOPNOTSUPP) | Some(libc::ENODATA) => Ok(Vec::new()),
                _ => Err(err),
            };
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut names = vec![0u8; len as usize];
        let len = unsafe {
            libc::llistxattr(
                cpath.as_ptr(),
                names.as_mut_ptr() as *mut libc::c_char,
                names.len(),
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        names.truncate(len as usize);

        let mut out = Vec::new();
        for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
            let cname = std::ffi::CString::new(name.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "xattr name"))?;
            let vlen =
                unsafe { libc::lgetxattr(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
            if vlen < 0 {
                continue; // attribute vanished between list and get
            }
            let mut value = vec![0u8; vlen as usize];
            let vlen = unsafe {
                libc::lgetxattr(
                    cpath.as_ptr(),
                    cname.as_ptr(),
                    value.as_mut_ptr() as *mut libc::c_void,
                    value.len(),
                )
            };
            if vlen < 0 {
                continue;
            }
            value.truncate(vlen as usize);
            out.push((String::from_utf8_lossy(name).into_owned(), value));
        }
        Ok(out)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        Ok(Vec::new())
    }
}

/// Set one extended attribute on a path.
pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let cpath = cstring(path)?;
        let cname = std::ffi::CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name"))?;
        let rc = unsafe {
            libc::lsetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (path, name, value);
        Ok(())
    }
}
