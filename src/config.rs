//! Engine configuration.
//!
//! Plain `key = value` files. Unknown keys are rejected, legacy key names
//! from older releases are accepted as synonyms for their current
//! counterparts.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use crate::tools;

/// Default transaction pool size.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Where the remote catalogue plane is driven from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtfileMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCompression {
    Lzo,
    Lzma,
    Lzw,
}

impl SessionCompression {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "lzo" => Ok(SessionCompression::Lzo),
            "lzma" => Ok(SessionCompression::Lzma),
            "lzw" => Ok(SessionCompression::Lzw),
            _ => bail!("invalid session_compression '{}'", value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: Option<String>,
    pub hostport: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,

    /// Transaction pool size.
    pub queue_depth: usize,
    /// Send rate cap in bytes per second, 0 disables.
    pub bandwidth: u64,
    pub session_compression: Option<SessionCompression>,

    pub ctfile_mode: CtfileMode,
    /// Cache directory, kept with a trailing `/` (see [Config::prepare_cachedir]).
    pub ctfile_cachedir: Option<String>,
    /// Byte cap for the cache directory, unbounded by default.
    pub ctfile_cachedir_max_size: u64,
    pub ctfile_remote_auto_differential: bool,
    /// Differential chain length that forces a full re-base, 0 disables.
    pub ctfile_max_differentials: u32,
    /// Age cutoff for cull, in days. Cull refuses to run when 0.
    pub ctfile_cull_keep_days: u32,

    pub upload_crypto_secrets: bool,
    pub crypto_secrets: Option<PathBuf>,
    pub crypto_passphrase: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            hostport: None,
            username: None,
            password: None,
            ca_cert: None,
            cert: None,
            key: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            bandwidth: 0,
            session_compression: None,
            ctfile_mode: CtfileMode::Local,
            ctfile_cachedir: None,
            ctfile_cachedir_max_size: u64::MAX,
            ctfile_remote_auto_differential: false,
            ctfile_max_differentials: 0,
            ctfile_cull_keep_days: 0,
            upload_crypto_secrets: false,
            crypto_secrets: None,
            crypto_passphrase: None,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => bail!("setting '{}' expects 0 or 1, got '{}'", key, value),
    }
}

/// Byte sizes accept an optional K/M/G/T suffix.
fn parse_size(key: &str, value: &str) -> Result<u64, Error> {
    let (digits, shift) = match value.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&value[..value.len() - 1], 10),
        Some(b'M') | Some(b'm') => (&value[..value.len() - 1], 20),
        Some(b'G') | Some(b'g') => (&value[..value.len() - 1], 30),
        Some(b'T') | Some(b't') => (&value[..value.len() - 1], 40),
        _ => (value, 0),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format_err!("setting '{}' expects a size, got '{}'", key, value))?;
    n.checked_shl(shift)
        .filter(|v| (v >> shift) == n)
        .ok_or_else(|| format_err!("setting '{}' overflows: '{}'", key, value))
}

impl Config {
    /// Parse configuration text, applying settings over `self`.
    pub fn apply(&mut self, contents: &str) -> Result<(), Error> {
        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.find('=') {
                Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
                None => bail!("config line {}: missing '=' in '{}'", lineno + 1, line),
            };
            self.set(key, value)
                .map_err(|err| format_err!("config line {}: {}", lineno + 1, err))?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "queue_depth" => {
                self.queue_depth = value
                    .parse()
                    .map_err(|_| format_err!("invalid queue_depth '{}'", value))?;
                if self.queue_depth == 0 {
                    bail!("queue_depth must be at least 1");
                }
            }
            "bandwidth" => {
                self.bandwidth = value
                    .parse()
                    .map_err(|_| format_err!("invalid bandwidth '{}'", value))?;
            }
            "host" => self.host = Some(value.to_string()),
            "hostport" => self.hostport = Some(value.to_string()),
            "username" => self.username = Some(value.to_string()),
            "password" => self.password = Some(value.to_string()),
            "ca_cert" => self.ca_cert = Some(PathBuf::from(value)),
            "cert" => self.cert = Some(PathBuf::from(value)),
            "key" => self.key = Some(PathBuf::from(value)),
            "crypto_secrets" => self.crypto_secrets = Some(PathBuf::from(value)),
            // the passphrase key name may not be modified, old configs depend on it
            "crypto_passphrase" | "crypto_password" => {
                self.crypto_passphrase = Some(value.to_string())
            }
            "session_compression" => {
                self.session_compression = Some(SessionCompression::parse(value)?)
            }
            "upload_crypto_secrets" => {
                self.upload_crypto_secrets = parse_bool(key, value)?;
            }
            "ctfile_cull_keep_days" | "ctfile_expire_day" => {
                self.ctfile_cull_keep_days = value
                    .parse()
                    .map_err(|_| format_err!("invalid {} '{}'", key, value))?;
            }
            "ctfile_mode" | "md_mode" => {
                self.ctfile_mode = match value {
                    "remote" => CtfileMode::Remote,
                    "local" => CtfileMode::Local,
                    _ => bail!("invalid ctfile mode '{}'", value),
                };
            }
            "ctfile_cachedir" | "md_cachedir" => {
                self.ctfile_cachedir = Some(value.to_string());
            }
            "ctfile_cachedir_max_size" | "md_cachedir_max_size" => {
                self.ctfile_cachedir_max_size = parse_size(key, value)?;
            }
            "ctfile_remote_auto_differential" | "md_remote_auto_differential" => {
                self.ctfile_remote_auto_differential = parse_bool(key, value)?;
            }
            "ctfile_max_differentials" | "md_max_differentials" => {
                self.ctfile_max_differentials = value
                    .parse()
                    .map_err(|_| format_err!("invalid {} '{}'", key, value))?;
            }
            _ => bail!("unknown setting '{}'", key),
        }
        Ok(())
    }

    /// Locate and load a configuration file.
    ///
    /// Search order: the explicit path if given, then
    /// `$HOME/.ctvault/ctvault.conf`, `$HOME/.ctvault.conf`,
    /// `/etc/ctvault/ctvault.conf`.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf), Error> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = explicit {
            candidates.push(path.to_owned());
        } else {
            if let Some(home) = std::env::var_os("HOME") {
                let home = PathBuf::from(home);
                candidates.push(home.join(".ctvault/ctvault.conf"));
                candidates.push(home.join(".ctvault.conf"));
            }
            candidates.push(PathBuf::from("/etc/ctvault/ctvault.conf"));
        }

        for candidate in candidates {
            if let Some(contents) = tools::file_read_optional_string(&candidate)? {
                let mut config = Config::default();
                config.apply(&contents)?;
                return Ok((config, candidate));
            }
        }

        bail!("no configuration file found");
    }

    /// Coerce the cache directory to a trailing `/` and create it (mode
    /// 0700) if missing. Required before any remote-mode operation.
    pub fn prepare_cachedir(&mut self) -> Result<(), Error> {
        let dir = match self.ctfile_cachedir {
            Some(ref mut dir) => dir,
            None => {
                if self.ctfile_mode == CtfileMode::Remote {
                    bail!("ctfile_cachedir is required in remote mode");
                }
                return Ok(());
            }
        };

        if !dir.ends_with('/') {
            dir.push('/');
        }

        let path = Path::new(dir.as_str());
        if !path.is_dir() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|err| format_err!("unable to create {:?} - {}", parent, err))?;
                }
            }
            nix::unistd::mkdir(path, nix::sys::stat::Mode::S_IRWXU)
                .map_err(|err| format_err!("unable to create cachedir {:?} - {}", path, err))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_current_and_legacy_keys() {
        let mut config = Config::default();
        config
            .apply(
                "# comment\n\
                 queue_depth = 42\n\
                 ctfile_mode = remote\n\
                 md_cachedir = /tmp/ctcache\n\
                 md_cachedir_max_size = 2G\n\
                 md_remote_auto_differential = 1\n\
                 md_max_differentials = 7\n\
                 ctfile_expire_day = 30\n\
                 crypto_password = hunter2hunter2\n\
                 session_compression = lzo\n",
            )
            .unwrap();

        assert_eq!(config.queue_depth, 42);
        assert_eq!(config.ctfile_mode, CtfileMode::Remote);
        assert_eq!(config.ctfile_cachedir.as_deref(), Some("/tmp/ctcache"));
        assert_eq!(config.ctfile_cachedir_max_size, 2 << 30);
        assert!(config.ctfile_remote_auto_differential);
        assert_eq!(config.ctfile_max_differentials, 7);
        assert_eq!(config.ctfile_cull_keep_days, 30);
        assert_eq!(config.crypto_passphrase.as_deref(), Some("hunter2hunter2"));
        assert_eq!(config.session_compression, Some(SessionCompression::Lzo));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_compression() {
        let mut config = Config::default();
        assert!(config.apply("no_such_setting = 1\n").is_err());
        assert!(config.apply("session_compression = gzip\n").is_err());
    }

    #[test]
    fn cachedir_gets_trailing_slash_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cache");

        let mut config = Config::default();
        config.ctfile_mode = CtfileMode::Remote;
        config.ctfile_cachedir = Some(target.to_str().unwrap().to_string());
        config.prepare_cachedir().unwrap();

        let coerced = config.ctfile_cachedir.unwrap();
        assert!(coerced.ends_with('/'));

        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn remote_mode_requires_cachedir() {
        let mut config = Config::default();
        config.ctfile_mode = CtfileMode::Remote;
        assert!(config.prepare_cachedir().is_err());
    }
}
