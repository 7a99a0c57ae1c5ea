//! File descriptor I/O that is safe to use from a signal handler.
//!
//! The free functions at the bottom are the auditable core: each one calls
//! the underlying syscall in a retry loop and nothing else. [`File`] wraps
//! them with ownership of the descriptor for the paths that run outside
//! signal context.

use std::ffi::{CString, OsString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::raw::c_char;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// How a file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permissions {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Permissions {
    fn open_flags(self) -> libc::c_int {
        match self {
            Permissions::ReadOnly => libc::O_RDONLY,
            Permissions::WriteOnly => libc::O_WRONLY,
            Permissions::ReadWrite => libc::O_RDWR,
        }
    }
}

/// An open file and the path it was opened at.
///
/// Moving a `File` transfers ownership of the descriptor; dropping it closes
/// the descriptor. The read and write paths go through the signal-safe free
/// functions below.
#[derive(Debug)]
pub struct File {
    fd: OwnedFd,
    path: PathBuf,
}

impl File {
    /// Creates a new file, failing if it already exists.
    pub fn create(path: &Path) -> io::Result<File> {
        let c_path = path_to_c_string(path)?;

        let fd = loop {
            let fd = unsafe {
                libc::open(
                    c_path.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    libc::S_IRUSR | libc::S_IWUSR,
                )
            };

            if fd != -1 {
                break fd;
            }

            let error = io::Error::last_os_error();
            if error.raw_os_error() != Some(libc::EINTR) {
                return Err(error);
            }
        };

        Ok(File {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            path: path.to_path_buf(),
        })
    }

    /// Creates a uniquely named file under `/tmp/<prefix>_XXXXXX`.
    pub fn create_temporary(prefix: &str) -> io::Result<File> {
        let mut template = format!("/tmp/{prefix}_XXXXXX").into_bytes();
        template.push(0);

        let fd = unsafe { libc::mkostemp(template.as_mut_ptr() as *mut c_char, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        // mkostemp replaced the Xs with the actual name.
        template.pop();
        let path = PathBuf::from(OsString::from_vec(template));

        Ok(File {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            path,
        })
    }

    /// Opens an existing file.
    pub fn open(path: &Path, permissions: Permissions) -> io::Result<File> {
        let c_path = path_to_c_string(path)?;

        let fd = loop {
            let fd = unsafe { libc::open(c_path.as_ptr(), permissions.open_flags()) };

            if fd != -1 {
                break fd;
            }

            let error = io::Error::last_os_error();
            if error.raw_os_error() != Some(libc::EINTR) {
                return Err(error);
            }
        };

        Ok(File {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            path: path.to_path_buf(),
        })
    }

    /// Reads until `target` is full, end of file, or a non-EINTR error.
    /// Returns how many bytes were read.
    pub fn read(&mut self, target: &mut [u8]) -> io::Result<usize> {
        read_from_file_descriptor(self.fd.as_raw_fd(), target)
    }

    /// Writes the whole of `source`, or fails with a non-EINTR error.
    /// Returns how many bytes were written.
    pub fn write(&mut self, source: &[u8]) -> io::Result<usize> {
        write_to_file_descriptor(self.fd.as_raw_fd(), source)
    }

    /// Seeks to an absolute offset from the start of the file.
    pub fn seek_absolute(&mut self, offset: i64) -> io::Result<()> {
        if unsafe { libc::lseek(self.fd.as_raw_fd(), offset, libc::SEEK_SET) } != offset {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Seeks back to the first byte of the file.
    pub fn seek_to_start(&mut self) -> io::Result<()> {
        self.seek_absolute(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the file and unlinks it from the filesystem.
    pub fn remove(self) -> io::Result<()> {
        let c_path = path_to_c_string(&self.path)?;
        drop(self.fd);

        if unsafe { libc::unlink(c_path.as_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Releases ownership of the descriptor without closing it.
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl AsRawFd for File {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn path_to_c_string(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))
}

/// Writes all of `source` to `file_descriptor`, retrying on EINTR.
///
/// Async-signal-safe: calls `write` and nothing else. The returned count is
/// the number of completed bytes, which equals `source.len()` on success.
pub fn write_to_file_descriptor(file_descriptor: RawFd, source: &[u8]) -> io::Result<usize> {
    let mut bytes_written = 0;

    while bytes_written < source.len() {
        let remaining = &source[bytes_written..];

        let result = unsafe {
            libc::write(
                file_descriptor,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
            )
        };

        if result < 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::EINTR) {
                continue;
            }

            return Err(error);
        }

        bytes_written += result as usize;
    }

    Ok(bytes_written)
}

/// Reads into `target` from `file_descriptor` until it is full, end of file,
/// or a non-EINTR error.
///
/// Async-signal-safe: calls `read` and nothing else. The returned count is
/// the number of completed bytes; it is less than `target.len()` only at end
/// of file.
pub fn read_from_file_descriptor(file_descriptor: RawFd, target: &mut [u8]) -> io::Result<usize> {
    let mut bytes_read = 0;

    while bytes_read < target.len() {
        let remaining = &mut target[bytes_read..];

        let result = unsafe {
            libc::read(
                file_descriptor,
                remaining.as_mut_ptr() as *mut libc::c_void,
                remaining.len(),
            )
        };

        if result < 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::EINTR) {
                continue;
            }

            return Err(error);
        }

        if result == 0 {
            // End of file.
            break;
        }

        bytes_read += result as usize;
    }

    Ok(bytes_read)
}

/// Closes a raw descriptor, for the paths that deliberately bypass [`File`]
/// ownership. Async-signal-safe.
///
/// The descriptor is invalid afterwards even if the close reports an error,
/// so there is no retry.
pub fn close_file_descriptor(file_descriptor: RawFd) {
    unsafe { libc::close(file_descriptor) };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("round-trip");

        let mut file = File::create(&path).unwrap();
        assert_eq!(file.write(b"swimps!").unwrap(), 7);

        file.seek_to_start().unwrap();
        let mut buffer = [0u8; 7];
        assert_eq!(file.read(&mut buffer).unwrap(), 7);
        assert_eq!(&buffer, b"swimps!");
    }

    #[test]
    fn seek_absolute_positions_the_next_read() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("seek");

        let mut file = File::create(&path).unwrap();
        file.write(b"0123456789").unwrap();

        file.seek_absolute(4).unwrap();
        let mut buffer = [0u8; 3];
        file.read(&mut buffer).unwrap();
        assert_eq!(&buffer, b"456");
    }

    #[test]
    fn create_is_exclusive() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("exclusive");

        let _file = File::create(&path).unwrap();
        assert!(File::create(&path).is_err());
    }

    #[test]
    fn read_stops_at_end_of_file() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("short");

        let mut file = File::create(&path).unwrap();
        file.write(b"abc").unwrap();
        file.seek_to_start().unwrap();

        let mut buffer = [0u8; 16];
        assert_eq!(file.read(&mut buffer).unwrap(), 3);
        assert_eq!(&buffer[..3], b"abc");
    }

    #[test]
    fn temporary_files_land_in_tmp_with_the_prefix() {
        let file = File::create_temporary("swimps_io_test").unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        assert!(path.starts_with("/tmp/swimps_io_test_"));

        file.remove().unwrap();
    }

    #[test]
    fn remove_unlinks_the_file() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("removed");

        let file = File::create(&path).unwrap();
        file.remove().unwrap();
        assert!(!path.exists());
    }
}
