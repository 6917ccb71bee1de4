//! Small file system helpers shared across the crate.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Error};
use nix::sys::stat;
use nix::unistd;

/// Read a file into a string, mapping "not found" to `None`.
pub fn file_read_optional_string<P: AsRef<Path>>(path: P) -> Result<Option<String>, Error> {
    let path = path.as_ref();
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                return Ok(None);
            }
            bail!("unable to open {:?} - {}", path, err);
        }
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|err| anyhow::format_err!("unable to read {:?} - {}", path, err))?;
    Ok(Some(contents))
}

/// Atomically replace the contents of `path`.
///
/// Note: we use mkstemp here because it works with different processes,
/// threads, and even tokio tasks.
pub fn replace_file<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let mode = perm.unwrap_or_else(|| {
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH
    });

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(&tmp_path);
        bail!("write to {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = unistd::unlink(&tmp_path);
        bail!("atomic rename to {:?} failed: {}", path, err);
    }

    Ok(())
}

/// The mtime of `path` in whole seconds, or `None` if the file is missing.
pub fn file_mtime<P: AsRef<Path>>(path: P) -> Result<Option<i64>, Error> {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path.as_ref()) {
        Ok(meta) => Ok(Some(meta.mtime())),
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                return Ok(None);
            }
            bail!("unable to stat {:?} - {}", path.as_ref(), err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_file_creates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");

        replace_file(&path, b"first", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        replace_file(&path, b"second", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn optional_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let got = file_read_optional_string(dir.path().join("nope")).unwrap();
        assert!(got.is_none());
    }
}
