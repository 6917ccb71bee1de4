//! Cull: client-driven server garbage collection.
//!
//! The client lists every dated ctfile, decides which survive the age
//! cutoff (chain ancestors of survivors survive too), deletes the rest,
//! and declares the surviving content hashes *precious* in a three-phase
//! uuid-scoped dialog. Only a uuid that reaches `complete` is committed,
//! so partial or concurrent attempts are ignored by the server.

use anyhow::{bail, format_err, Error};
use chrono::Local;
use log::{debug, info, warn};

use crate::client::Transport;
use crate::ctfile::{self, CtfileReader, MatchMode, DATE_FORMAT};
use crate::protocol::{CtrlMsg, HeaderFlags};

use super::core::Engine;
use super::{Completion, Entry, FileState, Op, TransKind, TransState};

/// Hashes per `ct_cull_shas` document.
pub const SHAS_PER_PACKET: usize = 1000;

const ALL_DATED_PATTERN: &str = "^[0-9]{8}-[0-9]{6}-.*";

impl<T: Transport> Engine<T> {
    /// Schedule a full cull pass.
    pub fn queue_cull(&mut self) -> Result<(), Error> {
        self.require_remote()?;
        if self.config.ctfile_cull_keep_days == 0 {
            bail!("cull: ctfile_cull_keep_days must be set in the configuration");
        }

        self.queue.enqueue(
            Op::new(Entry::CtfileList)
                .complete(Completion::CullFetchAll)
                .search(vec![ALL_DATED_PATTERN.to_string()], MatchMode::Regex),
        );
        self.queue.enqueue(Op::new(Entry::CullCollect));
        self.queue.enqueue(Op::new(Entry::CullSetup));
        self.queue.enqueue(Op::new(Entry::CullShas));
        self.queue
            .enqueue(Op::new(Entry::CullComplete).complete(Completion::CullDone));
        Ok(())
    }

    /// The full listing arrived: record it and splice downloads for
    /// everything not cached, so chain walking can read each file.
    pub(crate) fn cull_fetch_all_complete(&mut self, op: Op) -> Result<(), Error> {
        let results = self.take_listing(&op)?;
        let cachedir = self.cachedir()?.to_string();

        let mut missing = Vec::new();
        for (name, entry) in results {
            if ctfile::in_cache(&cachedir, &name)? {
                debug!("already got {}", name);
            } else {
                missing.push(name.clone());
            }
            self.cull.files.insert(name, entry);
        }

        // splices run newest-last-in-first-out; reverse so the downloads
        // happen in chronological order
        for name in missing.into_iter().rev() {
            let cachepath = ctfile::cachename(&cachedir, &name);
            debug!("getting {} to {:?}", name, cachepath);
            self.queue.enqueue_next(
                Op::new(Entry::CtfileExtract)
                    .local_name(cachepath)
                    .remote_name(name),
            );
        }
        Ok(())
    }

    /// Mark survivors, propagate keeps along `previous` chains, queue
    /// deletes, and collect the precious hashes.
    pub(crate) fn cull_collect(&mut self) -> Result<(), Error> {
        let days = self.config.ctfile_cull_keep_days;
        if days == 0 {
            bail!("cull: ctfile_cull_keep_days must be set in the configuration");
        }
        let cachedir = self.cachedir()?.to_string();

        let cutoff = Local::now() - chrono::Duration::days(days as i64);
        let cutoff = cutoff.format(DATE_FORMAT).to_string();

        let mut keep_files = 0;
        for (name, file) in self.cull.files.iter_mut() {
            let prefix = name.get(..cutoff.len()).unwrap_or(name.as_str());
            if prefix < cutoff.as_str() {
                file.keep = 0;
            } else {
                file.keep = 1;
                keep_files += 1;
            }
        }

        if keep_files == 0 {
            bail!("all ctfiles are old and would be deleted, aborting");
        }

        // every file's chain props up its ancestors, so an old basis that
        // anything still references survives the sweep
        let names: Vec<String> = self.cull.files.keys().cloned().collect();

        for name in names {
            let mut prev = ctfile::read_previous(ctfile::cachename(&cachedir, &name))?;
            while let Some(prevname) = prev {
                if prevname.is_empty() {
                    break;
                }
                let cooked = ctfile::cook_name(&prevname)?;
                match self.cull.files.get_mut(&cooked) {
                    None => {
                        warn!("file not found in ctfile list [{}]", cooked);
                        break;
                    }
                    Some(prevfile) => {
                        if prevfile.keep == 0 {
                            info!(
                                "old ctfile {} still referenced by newer backups, keeping",
                                cooked
                            );
                        }
                        prevfile.keep += 1;
                    }
                }
                prev = ctfile::read_previous(ctfile::cachename(&cachedir, &cooked))?;
            }
        }

        let mut delete = Vec::new();
        let mut keep = Vec::new();
        for (name, file) in &self.cull.files {
            if file.keep == 0 {
                delete.push(name.clone());
            } else {
                keep.push(name.clone());
            }
        }

        for name in delete {
            debug!("adding {} to delete list", name);
            self.queue
                .enqueue(Op::new(Entry::CtfileDelete).remote_name(name));
        }
        for name in keep {
            debug!("adding {} to keep list", name);
            self.cull_add_shafile(&cachedir, &name)?;
        }
        self.stats.sha_count = self.cull.shas.len() as u64;

        self.cull.files.clear();
        self.file_state = FileState::Finished;
        self.current_done = true;
        Ok(())
    }

    fn cull_add_shafile(&mut self, cachedir: &str, name: &str) -> Result<(), Error> {
        let path = ctfile::cachename(cachedir, name);
        let mut reader = CtfileReader::open(&path)?;
        let shas = &mut self.cull.shas;
        reader.for_each_sha(|sha| {
            shas.insert(*sha);
            Ok(())
        })
    }

    pub(crate) fn cull_setup(&mut self) -> Result<(), Error> {
        debug!("cull_setup");
        self.file_state = FileState::Running;

        let mut trans = match self.alloc_trans() {
            Some(trans) => trans,
            None => return Ok(()),
        };

        let uuid = match self.cull.uuid {
            Some(uuid) => uuid,
            None => {
                let mut buf = [0u8; 8];
                openssl::rand::rand_bytes(&mut buf)
                    .map_err(|err| format_err!("unable to generate cull uuid - {}", err))?;
                let uuid = u64::from_le_bytes(buf);
                self.cull.uuid = Some(uuid);
                uuid
            }
        };

        trans.kind = TransKind::XmlCtrl;
        trans.state = TransState::XmlCullSend;
        trans.flags = HeaderFlags::METADATA;
        trans.set_ctrl_body(CtrlMsg::CullSetup { uuid }.render());
        self.file_state = FileState::Finished;
        self.submit_trans(trans);
        Ok(())
    }

    /// Send one batch of precious hashes; the batch reply wakes us for
    /// the next until the set drains.
    pub(crate) fn cull_send_shas(&mut self) -> Result<(), Error> {
        debug!("cull_send_shas, {} remaining", self.cull.shas.len());

        if self.cull.shas.is_empty() {
            self.file_state = FileState::Finished;
            self.current_done = true;
            return Ok(());
        }
        self.file_state = FileState::Running;

        let mut trans = match self.alloc_trans() {
            Some(trans) => trans,
            None => return Ok(()),
        };

        let uuid = self
            .cull
            .uuid
            .ok_or_else(|| format_err!("cull shas before setup"))?;

        let mut batch = Vec::with_capacity(SHAS_PER_PACKET);
        while batch.len() < SHAS_PER_PACKET {
            let sha = match self.cull.shas.iter().next() {
                Some(sha) => *sha,
                None => break,
            };
            self.cull.shas.remove(&sha);
            batch.push(sha);
        }

        if self.cull.shas.is_empty() {
            trans.eof = true;
            self.file_state = FileState::Finished;
        }

        debug!("sending {} shas", batch.len());
        let body = CtrlMsg::CullShas { uuid, shas: batch }.render();
        self.stats.sha_payload += body.len() as u64;

        trans.kind = TransKind::XmlCtrl;
        trans.state = TransState::XmlCullSend;
        trans.flags = HeaderFlags::METADATA;
        trans.set_ctrl_body(body);
        self.submit_trans(trans);
        Ok(())
    }

    pub(crate) fn cull_send_complete(&mut self) -> Result<(), Error> {
        if self.cull.sent_complete {
            self.file_state = FileState::Finished;
            return Ok(());
        }

        let mut trans = match self.alloc_trans() {
            Some(trans) => trans,
            None => return Ok(()),
        };
        self.cull.sent_complete = true;

        let uuid = self
            .cull
            .uuid
            .ok_or_else(|| format_err!("cull complete before setup"))?;
        debug!("send cull_complete");

        trans.kind = TransKind::XmlCtrl;
        trans.state = TransState::XmlCullSend;
        trans.flags = HeaderFlags::METADATA;
        trans.set_ctrl_body(CtrlMsg::CullComplete { uuid }.render());
        self.file_state = FileState::Finished;
        self.submit_trans(trans);
        Ok(())
    }

    pub(crate) fn cull_done(&mut self, _op: Op) -> Result<(), Error> {
        debug!(
            "cull finished: {} precious hashes, {} payload bytes",
            self.stats.sha_count, self.stats.sha_payload
        );
        Ok(())
    }
}
