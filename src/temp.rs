//! Temporary files and directories.

use libc;
use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::err::{Error, Result};
use crate::path;

/// Wraps `mkdtemp()`.  The template must end in `XXXXXX`; the created
/// directory's path is returned.
pub fn mkdtemp<P: AsRef<Path>>(template: P) -> Result<PathBuf> {
    let template = CString::new(template.as_ref().as_os_str().as_bytes())?;
    unsafe {
        let temp = template.as_ptr();
        let ret = libc::mkdtemp(temp as *mut libc::c_char); // modifies template
        if ret.is_null() {
            return Err(Error::last_os_error("mkdtemp"));
        }
    }
    let name = PathBuf::from(template.into_string().map_err(|_| Error::BadStr)?);
    debug!("Temp dir: {}", name.display());
    Ok(name)
}

/// Wraps `mkstemp()`.  Returns the open file and its path.
pub fn mkstemp<P: AsRef<Path>>(template: P) -> Result<(File, PathBuf)> {
    let template = CString::new(template.as_ref().as_os_str().as_bytes())?;
    let fd = unsafe { libc::mkstemp(template.as_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(Error::last_os_error("mkstemp"));
    }
    let name = PathBuf::from(template.into_string().map_err(|_| Error::BadStr)?);
    debug!("Temp file: {}", name.display());
    Ok((unsafe { File::from_raw_fd(fd) }, name))
}

/// A temporary directory which will be `rm -rf` when dropped.
#[derive(Debug)]
pub struct TempDir {
    name: PathBuf,
}

impl TempDir {
    /// Create a new temporary directory
    pub fn new() -> Result<TempDir> {
        Self::with_prefix("sandbox-")
    }

    /// Create a new temporary directory whose name starts with `prefix`.
    pub fn with_prefix(prefix: &str) -> Result<TempDir> {
        let template = path!(std::env::temp_dir(), format!("{}XXXXXX", prefix));
        let name = mkdtemp(template)?;
        Ok(TempDir { name })
    }

    /// Where is it?
    pub fn path(&self) -> &Path {
        &self.name
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.name) {
            error!(
                "Unable to remove temporary directory: {} : {}",
                self.name.display(),
                err
            );
        } else {
            debug!("Cleaned up: {}", self.name.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::write_file;

    #[test]
    fn test_tempdir() {
        let tdir = TempDir::new().unwrap();
        let dir = tdir.path().to_path_buf();

        assert!(dir.is_dir());

        let tfile = dir.join("test.txt");
        assert!(!tfile.is_file());
        write_file(&tfile, "Hello world").unwrap();
        assert!(tfile.is_file());

        drop(tdir);
        assert!(!tfile.is_file());
        assert!(!dir.is_dir());
    }

    #[test]
    fn test_prefix() {
        let tdir = TempDir::with_prefix("ssh-").unwrap();
        let base = tdir.path().file_name().unwrap().to_str().unwrap();
        assert!(base.starts_with("ssh-"), "{:?}", base);
    }

    #[test]
    fn test_mkstemp() {
        let tdir = TempDir::new().unwrap();
        let (file, name) = mkstemp(tdir.path().join("cow-XXXXXX")).unwrap();
        assert!(name.is_file());
        assert!(!name.to_str().unwrap().ends_with("XXXXXX"));
        drop(file);
    }
}
