//! The local ctfile cache directory.
//!
//! A flat directory mirroring remote catalogue files. The configured path
//! always carries a trailing `/` (coerced at config time), so building a
//! cache entry path is plain concatenation.

use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use regex::Regex;

use super::CTFILE_MAXLEN;

/// Bytes never allowed in a tag; they collide with shell quoting or path
/// separators on at least one supported platform.
pub const NAME_REJECT_BYTES: &[u8] = b"/\\*?\"'`<>|;&";

lazy_static! {
    static ref FULLNAME_RE: Regex = Regex::new(r"^[0-9]{8}-[0-9]{6}-").unwrap();
}

/// Strftime-style pattern for the date prefix.
pub const DATE_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Reduce a tag to its basename, so remote names never carry path
/// components.
pub fn cook_name(tag: &str) -> Result<String, Error> {
    let cooked = match tag.rsplit('/').next() {
        Some(base) => base,
        None => tag,
    };
    if cooked.is_empty() {
        bail!("invalid ctfile name '{}'", tag);
    }
    Ok(cooked.to_string())
}

/// Whether the tag already carries the `YYYYMMDD-HHMMSS-` date prefix.
pub fn is_fullname(name: &str) -> bool {
    FULLNAME_RE.is_match(name)
}

/// Exact-match scan of the cache directory.
pub fn in_cache(cachedir: &str, name: &str) -> Result<bool, Error> {
    let entries = std::fs::read_dir(cachedir)
        .map_err(|err| format_err!("can't open cache dir {} - {}", cachedir, err))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_str() == Some(name) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The path a ctfile has (or would have) in the cache directory.
pub fn cachename(cachedir: &str, name: &str) -> PathBuf {
    debug_assert!(cachedir.ends_with('/'));
    PathBuf::from(format!("{}{}", cachedir, name))
}

/// Build the dated remote name for a new archive and make sure nothing in
/// the cache would be overwritten by it.
pub fn find_for_archive(
    cachedir: &str,
    tag: &str,
    now: DateTime<Local>,
) -> Result<(String, PathBuf), Error> {
    let cooked = cook_name(tag)?;
    if is_fullname(&cooked) {
        bail!("ctfile name '{}' already carries a date tag", cooked);
    }

    let fullname = format!("{}-{}", now.format(DATE_FORMAT), cooked);
    if in_cache(cachedir, &fullname)? {
        bail!("generated ctfile name {} already in cache dir", fullname);
    }

    Ok((fullname.clone(), cachename(cachedir, &fullname)))
}

/// Verify that a tag is kosher before any network traffic: it must still
/// fit the name limit once date-prefixed and base64-encoded, and must not
/// contain bytes from the reject set.
pub fn verify_name(tag: &str) -> Result<(), Error> {
    let prefixed_len = "YYYYMMDD-HHMMSS-".len() + tag.len();
    if prefixed_len >= CTFILE_MAXLEN {
        bail!("ctfile name '{}' too long", tag);
    }
    // base64 expands by 4/3, check the encoded form fits as well
    if (prefixed_len + 2) / 3 * 4 >= CTFILE_MAXLEN {
        bail!("ctfile name '{}' too long once encoded", tag);
    }
    for &byte in tag.as_bytes() {
        if byte < 0x20 || NAME_REJECT_BYTES.contains(&byte) {
            bail!("ctfile name '{}' contains rejected character", tag);
        }
    }
    Ok(())
}

/// Walk the differential chain from `name` (which must be cached) and
/// count its length. Stops at a full backup or a missing cache entry.
pub fn chain_length(cachedir: &str, name: &str) -> Result<u32, Error> {
    let mut length = 0;
    let mut current = name.to_string();
    loop {
        let path = cachename(cachedir, &current);
        if !path.is_file() {
            return Ok(length);
        }
        match super::read_previous(&path)? {
            Some(prev) if !prev.is_empty() => {
                length += 1;
                current = cook_name(&prev)?;
            }
            _ => return Ok(length),
        }
    }
}

/// Drop oldest entries (by the date prefix) until the cache directory is
/// under `max_size` bytes. Returns the names removed.
pub fn trim(cachedir: &str, max_size: u64) -> Result<Vec<String>, Error> {
    let mut entries: Vec<(String, u64)> = Vec::new();
    let mut total: u64 = 0;

    for entry in std::fs::read_dir(cachedir)
        .map_err(|err| format_err!("can't open cache dir {} - {}", cachedir, err))?
    {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        total += meta.len();
        entries.push((name, meta.len()));
    }

    if total <= max_size {
        return Ok(Vec::new());
    }

    entries.sort();

    let mut removed = Vec::new();
    for (name, size) in entries {
        if total <= max_size {
            break;
        }
        std::fs::remove_file(cachename(cachedir, &name))?;
        total -= size;
        removed.push(name);
    }
    Ok(removed)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn cachedir(dir: &tempfile::TempDir) -> String {
        format!("{}/", dir.path().display())
    }

    #[test]
    fn cook_name_takes_basename_and_is_idempotent() {
        assert_eq!(cook_name("some/path/to/tag").unwrap(), "tag");
        assert_eq!(cook_name("tag").unwrap(), "tag");
        let once = cook_name("a/b").unwrap();
        assert_eq!(cook_name(&once).unwrap(), once);
        assert!(cook_name("trailing/").is_err());
    }

    #[test]
    fn fullname_detection() {
        assert!(is_fullname("20240102-030405-photos"));
        assert!(!is_fullname("photos"));
        assert!(!is_fullname("2024010-030405-short"));
    }

    #[test]
    fn verify_name_rejects_bad_bytes() {
        assert!(verify_name("photos").is_ok());
        assert!(verify_name("pho/tos").is_err());
        assert!(verify_name("pho|tos").is_err());
        assert!(verify_name("pho\ntos").is_err());
        let long = "x".repeat(CTFILE_MAXLEN);
        assert!(verify_name(&long).is_err());
    }

    #[test]
    fn find_for_archive_formats_and_checks_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cachedir = cachedir(&dir);
        let now = Local.ymd(2024, 1, 2).and_hms(3, 4, 5);

        let (name, path) = find_for_archive(&cachedir, "photos", now).unwrap();
        assert_eq!(name, "20240102-030405-photos");
        assert_eq!(path, cachename(&cachedir, &name));

        std::fs::write(&path, b"x").unwrap();
        assert!(find_for_archive(&cachedir, "photos", now).is_err());
        assert!(find_for_archive(&cachedir, "20240101-000000-dated", now).is_err());
    }

    #[test]
    fn in_cache_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let cachedir = cachedir(&dir);
        std::fs::write(dir.path().join("20240102-030405-a"), b"x").unwrap();

        assert!(in_cache(&cachedir, "20240102-030405-a").unwrap());
        assert!(!in_cache(&cachedir, "20240102-030405").unwrap());
    }

    #[test]
    fn trim_removes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cachedir = cachedir(&dir);
        std::fs::write(dir.path().join("20240101-000000-a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("20240201-000000-a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("20240301-000000-a"), vec![0u8; 100]).unwrap();

        let removed = trim(&cachedir, 250).unwrap();
        assert_eq!(removed, vec!["20240101-000000-a".to_string()]);
        assert!(!in_cache(&cachedir, "20240101-000000-a").unwrap());
        assert!(in_cache(&cachedir, "20240301-000000-a").unwrap());
    }
}
