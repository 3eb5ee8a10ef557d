use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use tempfile::NamedTempFile;

/// A fresh pipe as (reader, writer).
pub(crate) fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points at two writable ints.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: both descriptors are fresh and owned solely by the Files.
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// A scratch file pre-populated with `contents`, kept alive (and unlinked)
/// by the returned handle.
pub(crate) fn sample_file(contents: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(file)
}
