//! Crypto-secrets synchronization.
//!
//! The passphrase-protected keyfile is mirrored on the server under the
//! name `<20-digit-mtime>-crypto.secrets`; the zero-padded mtime prefix
//! makes lexical order numeric order. Whoever has the newer mtime wins:
//! equal mtimes unlock in place, a newer local file is uploaded, a newer
//! remote file is downloaded to a tmp file and only adopted once it
//! proves it unlocks.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use log::{debug, info, warn};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::client::Transport;
use crate::ctfile::{self, MatchMode};
use crate::tools;

use super::core::Engine;
use super::{Completion, Entry, Op};

/// The AEAD primitives guarding the secrets file. Out of the engine's
/// scope; embedders supply an implementation.
pub trait SecretsCrypto {
    /// Verify the passphrase opens the file, loading its keys.
    fn unlock(&mut self, path: &Path, passphrase: &str) -> Result<(), Error>;

    /// Generate a fresh secrets file protected by the passphrase.
    fn create(&mut self, path: &Path, passphrase: &str) -> Result<(), Error>;
}

const SECRETS_PATTERN: &str = "*-crypto.secrets";

impl<T: Transport> Engine<T> {
    /// Schedule the secrets sync. Queue this before any user action so
    /// the keyfile is coherent by the time data moves.
    pub fn queue_secrets_sync(&mut self) -> Result<(), Error> {
        self.require_remote()?;
        if !self.config.upload_crypto_secrets {
            bail!("upload_crypto_secrets is not enabled");
        }
        let secrets = self
            .config
            .crypto_secrets
            .clone()
            .ok_or_else(|| format_err!("no crypto_secrets file configured"))?;

        self.queue.enqueue(
            Op::new(Entry::CtfileList)
                .complete(Completion::SecretsCheck)
                .local_name(secrets)
                .search(vec![SECRETS_PATTERN.to_string()], MatchMode::Glob),
        );
        Ok(())
    }

    /// Listing done: compare mtimes and decide the direction.
    pub(crate) fn secrets_check_complete(&mut self, op: Op) -> Result<(), Error> {
        let results = self.take_listing(&op)?;
        let current = op
            .local_name
            .ok_or_else(|| format_err!("secrets sync without a local file"))?;

        let mut remote_mtime: i64 = 0;
        let mut remote_name: Option<String> = None;
        if let Some(newest) = ctfile::newest(&results) {
            debug!("latest secrets file on server: {}", newest.name);
            let prefix = newest
                .name
                .split('-')
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| format_err!("invalid answer from server"))?;
            remote_mtime = prefix
                .parse()
                .map_err(|_| format_err!("mtime {} from secrets file invalid", prefix))?;
            remote_name = Some(newest.name.clone());
        }

        let local_mtime = tools::file_mtime(&current)?.unwrap_or(0);

        if remote_mtime == local_mtime {
            // includes the case where both are missing
            debug!("dates match, nothing to do");
            self.unlock_or_create(&current)
        } else if remote_mtime < local_mtime {
            debug!("uploading local secrets file");
            let remote = format!("{:020}-crypto.secrets", local_mtime);
            self.queue.enqueue_next(
                Op::new(Entry::CtfileArchive)
                    .complete(Completion::SecretsUnlock)
                    .local_name(current)
                    .remote_name(remote),
            );
            Ok(())
        } else {
            // empty listings sort below a pre-epoch local mtime; with no
            // remote copy there is nothing to fetch
            let remote_name = match remote_name {
                Some(remote_name) => remote_name,
                None => {
                    debug!("no secrets file on server, keeping local one");
                    return self.unlock_or_create(&current);
                }
            };

            debug!("downloading remote secrets file");
            let dir = match current.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let template = dir.join(".ctcrypto.XXXXXX");
            let (fd, tmp_path) = nix::unistd::mkstemp(&template)
                .map_err(|err| format_err!("can't make temporary file - {}", err))?;
            debug!("temp file: {:?}", tmp_path);

            use std::os::unix::io::FromRawFd;
            self.pending_handle = Some(unsafe { File::from_raw_fd(fd) });

            // stash the real path so the unlock step can fall back
            self.queue.enqueue_next(
                Op::new(Entry::CtfileExtract)
                    .complete(Completion::SecretsUnlock)
                    .local_name(tmp_path)
                    .remote_name(remote_name)
                    .basis(current),
            );
            Ok(())
        }
    }

    /// The transfer finished; verify and adopt (or fall back).
    pub(crate) fn secrets_unlock_complete(&mut self, op: Op) -> Result<(), Error> {
        debug!("operation complete, unlocking secrets file");
        let crypto = op
            .local_name
            .ok_or_else(|| format_err!("secrets unlock without a file"))?;

        let real = match op.basis {
            // upload path: the local file simply stays authoritative
            None => return self.unlock_or_create(&crypto),
            Some(real) => real,
        };

        let passphrase = self.passphrase()?.to_string();
        let unlocked = crypto.is_file()
            && self
                .secrets_crypto()?
                .unlock(&crypto, &passphrase)
                .is_ok();
        if !unlocked {
            let _ = std::fs::remove_file(&crypto);
            warn!("can't unlock new secrets file, using old one");
            return self.unlock_or_create(&real);
        }

        // keep a backup of the file we are replacing
        let mut bak = real.clone().into_os_string();
        bak.push(".bak");
        let bak = PathBuf::from(bak);
        let _ = std::fs::remove_file(&bak);
        if real.is_file() {
            if let Err(err) = std::fs::hard_link(&real, &bak) {
                warn!("unable to backup secrets file - {}", err);
            }
        }

        std::fs::rename(&crypto, &real)
            .map_err(|err| format_err!("can't rename secrets file to real name - {}", err))?;

        // adopt the mtime we downloaded
        let remote = op
            .remote_name
            .ok_or_else(|| format_err!("secrets download without a remote name"))?;
        let prefix = remote.split('-').next().unwrap_or("");
        let mtime: i64 = prefix
            .parse()
            .map_err(|_| format_err!("mtime {} from secrets file invalid", prefix))?;
        let stamp = TimeVal::seconds(mtime);
        if let Err(err) = nix::sys::stat::utimes(&real, &stamp, &stamp) {
            warn!("couldn't set mtime on new secrets file - {}", err);
        }
        Ok(())
    }

    fn unlock_or_create(&mut self, path: &Path) -> Result<(), Error> {
        let passphrase = self.passphrase()?.to_string();
        let exists = path.is_file();
        let secrets = self.secrets_crypto()?;
        if !exists {
            info!("no crypto secrets file, creating");
            secrets.create(path, &passphrase)?;
        }
        secrets
            .unlock(path, &passphrase)
            .map_err(|err| format_err!("can't unlock secrets file - {}", err))
    }

    fn passphrase(&self) -> Result<&str, Error> {
        self.config
            .crypto_passphrase
            .as_deref()
            .ok_or_else(|| format_err!("no crypto passphrase configured"))
    }

    fn secrets_crypto(&mut self) -> Result<&mut (dyn SecretsCrypto + 'static), Error> {
        match self.secrets {
            Some(ref mut secrets) => Ok(secrets.as_mut()),
            None => bail!("no secrets crypto configured"),
        }
    }
}
