//! Workflow planning: tag resolution, differential chains, and the
//! public operation queueing API.
//!
//! Tags passed in remote mode are opaque names; on the server they live
//! in the form `YYYYMMDD-HHMMSS-<tag>`. Resolving a tag means listing the
//! server, picking the newest dated match, and downloading every member
//! of its `previous` chain that is not cached yet. Only then does the
//! user-visible action run.

use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use chrono::Local;
use log::{debug, info};

use crate::client::Transport;
use crate::config::CtfileMode;
use crate::ctfile::{self, MatchMode};

use super::core::Engine;
use super::{Action, Completion, Entry, Op};

impl<T: Transport> Engine<T> {
    /// Schedule a backup of the local tree under `tag`.
    ///
    /// In remote mode the archive is differential against the newest
    /// prior backup of the tag (or of `basis`) when automatic
    /// differentials are enabled or a basis is given.
    pub fn queue_archive(
        &mut self,
        tag: &str,
        filelist: Vec<String>,
        excludelist: Vec<String>,
        matchmode: MatchMode,
        basis: Option<String>,
    ) -> Result<(), Error> {
        if self.config.ctfile_mode == CtfileMode::Local {
            let op = Op::new(Entry::ArchiveData)
                .action(Action::Archive)
                .local_name(PathBuf::from(tag))
                .filelist(filelist)
                .excludelist(excludelist)
                .matchmode(matchmode);
            self.queue.enqueue(match basis {
                Some(basis) => op.basis(PathBuf::from(basis)),
                None => op,
            });
            return Ok(());
        }

        ctfile::verify_name(tag)?;
        let cooked = ctfile::cook_name(tag)?;

        if self.config.ctfile_remote_auto_differential || basis.is_some() {
            let search = match basis {
                Some(ref basis) => ctfile::cook_name(basis)?,
                None => cooked.clone(),
            };
            self.queue_find(&search, cooked, Action::Archive, filelist, excludelist, matchmode)
        } else {
            let cachedir = self.cachedir()?.to_string();
            let (fullname, cachepath) =
                ctfile::find_for_archive(&cachedir, &cooked, Local::now())?;
            debug!("backup file is {}", fullname);
            self.queue.enqueue(
                Op::new(Entry::ArchiveData)
                    .action(Action::Archive)
                    .local_name(cachepath.clone())
                    .filelist(filelist)
                    .excludelist(excludelist)
                    .matchmode(matchmode),
            );
            self.queue.enqueue(
                Op::new(Entry::CtfileArchive)
                    .local_name(cachepath)
                    .remote_name(fullname),
            );
            Ok(())
        }
    }

    /// Schedule restoring the backup `tag` into the working directory.
    pub fn queue_extract(
        &mut self,
        tag: &str,
        filelist: Vec<String>,
        excludelist: Vec<String>,
        matchmode: MatchMode,
    ) -> Result<(), Error> {
        if self.config.ctfile_mode == CtfileMode::Local {
            self.queue.enqueue(
                Op::new(Entry::ExtractData)
                    .action(Action::Extract)
                    .local_name(PathBuf::from(tag))
                    .filelist(filelist)
                    .excludelist(excludelist)
                    .matchmode(matchmode),
            );
            return Ok(());
        }
        let cooked = ctfile::cook_name(tag)?;
        let search = cooked.clone();
        self.queue_find(&search, cooked, Action::Extract, filelist, excludelist, matchmode)
    }

    /// Schedule listing the contents of the backup `tag`.
    pub fn queue_list(
        &mut self,
        tag: &str,
        filelist: Vec<String>,
        excludelist: Vec<String>,
        matchmode: MatchMode,
    ) -> Result<(), Error> {
        if self.config.ctfile_mode == CtfileMode::Local {
            self.queue.enqueue(
                Op::new(Entry::ListData)
                    .action(Action::List)
                    .local_name(PathBuf::from(tag))
                    .filelist(filelist)
                    .excludelist(excludelist)
                    .matchmode(matchmode),
            );
            return Ok(());
        }
        let cooked = ctfile::cook_name(tag)?;
        let search = cooked.clone();
        self.queue_find(&search, cooked, Action::List, filelist, excludelist, matchmode)
    }

    /// Schedule downloading the ctfile chain for `tag` into the cache and
    /// nothing else. The landing path is available from [Engine::fetched]
    /// afterwards.
    pub fn queue_fetch(&mut self, tag: &str) -> Result<(), Error> {
        self.require_remote()?;
        let cooked = ctfile::cook_name(tag)?;
        let search = cooked.clone();
        self.queue_find(
            &search,
            cooked,
            Action::JustDl,
            Vec::new(),
            Vec::new(),
            MatchMode::Glob,
        )
    }

    /// Upload an existing catalogue file under `tag` without touching the
    /// data plane.
    pub fn queue_ctfile_push(&mut self, local: PathBuf, tag: &str) -> Result<(), Error> {
        self.require_remote()?;
        ctfile::verify_name(tag)?;
        let cooked = ctfile::cook_name(tag)?;
        let remote = if ctfile::is_fullname(&cooked) {
            cooked
        } else {
            format!("{}-{}", Local::now().format(ctfile::DATE_FORMAT), cooked)
        };
        self.queue.enqueue(
            Op::new(Entry::CtfileArchive)
                .local_name(local)
                .remote_name(remote),
        );
        Ok(())
    }

    /// List remote catalogue files matching `patterns` (all when empty).
    pub fn queue_ctfile_list(
        &mut self,
        patterns: Vec<String>,
        mode: MatchMode,
    ) -> Result<(), Error> {
        self.require_remote()?;
        self.queue.enqueue(
            Op::new(Entry::CtfileList)
                .complete(Completion::StoreList)
                .search(patterns, mode),
        );
        Ok(())
    }

    /// Delete one remote catalogue file by its full dated name.
    pub fn queue_ctfile_delete(&mut self, name: &str) -> Result<(), Error> {
        self.require_remote()?;
        let cooked = ctfile::cook_name(name)?;
        self.queue
            .enqueue(Op::new(Entry::CtfileDelete).remote_name(cooked));
        Ok(())
    }

    /// Enqueue the list op that starts tag resolution.
    fn queue_find(
        &mut self,
        search_tag: &str,
        tag: String,
        action: Action,
        filelist: Vec<String>,
        excludelist: Vec<String>,
        matchmode: MatchMode,
    ) -> Result<(), Error> {
        self.require_remote()?;

        let (patterns, mode) = if ctfile::is_fullname(search_tag) {
            // use the listing as a stat of the literal name
            (vec![search_tag.to_string()], MatchMode::Glob)
        } else {
            (
                vec![format!(
                    "^[0-9]{{8}}-[0-9]{{6}}-{}$",
                    regex::escape(search_tag)
                )],
                MatchMode::Regex,
            )
        };
        debug!("looking for {}", patterns[0]);

        self.queue.enqueue(
            Op::new(Entry::CtfileList)
                .complete(Completion::FindForExtract)
                .action(action)
                .tag(tag)
                .filelist(filelist)
                .excludelist(excludelist)
                .matchmode(matchmode)
                .search(patterns, mode),
        );
        Ok(())
    }

    /// The resolution listing finished: pick the newest match and make
    /// sure it is cached before the user-visible action runs.
    pub(crate) fn find_for_extract_complete(&mut self, mut op: Op) -> Result<(), Error> {
        let results = self.take_listing(&op)?;

        let best = match ctfile::newest(&results) {
            Some(entry) => entry.name.clone(),
            None => {
                if op.action == Action::Archive {
                    // first-ever backup of this tag
                    op.local_name = None;
                    return self.extract_nextop(op);
                }
                bail!(
                    "unable to find ctfile tagged {}",
                    op.tag.as_deref().unwrap_or("(none)")
                );
            }
        };
        debug!("backup file is {}", best);

        let cachedir = self.cachedir()?.to_string();
        let cachepath = ctfile::cachename(&cachedir, &best);

        if !ctfile::in_cache(&cachedir, &best)? {
            let mut next = Op::new(Entry::CtfileExtract)
                .complete(Completion::ExtractNextop)
                .action(op.action)
                .local_name(cachepath)
                .remote_name(best)
                .filelist(std::mem::take(&mut op.filelist))
                .excludelist(std::mem::take(&mut op.excludelist))
                .matchmode(op.matchmode);
            next.tag = op.tag.take();
            self.queue.enqueue_next(next);
            Ok(())
        } else {
            // cached already; the rest of the chain may still be missing
            op.local_name = Some(cachepath);
            self.extract_nextop(op)
        }
    }

    /// The newest chain element is in place: splice downloads for the
    /// rest of the chain, then queue the user-visible operation.
    pub(crate) fn extract_nextop(&mut self, op: Op) -> Result<(), Error> {
        self.stream.is_open = false;

        match op.action {
            Action::Extract | Action::List | Action::JustDl => {
                if let Some(ref path) = op.local_name {
                    self.walk_chain(path.clone())?;
                }
            }
            _ => {}
        }

        // chain downloads spliced above run before anything queued below
        match op.action {
            Action::Extract => {
                let local = op
                    .local_name
                    .ok_or_else(|| format_err!("extract without a resolved ctfile"))?;
                self.queue.enqueue(
                    Op::new(Entry::ExtractData)
                        .action(Action::Extract)
                        .local_name(local)
                        .filelist(op.filelist)
                        .excludelist(op.excludelist)
                        .matchmode(op.matchmode),
                );
            }
            Action::List => {
                let local = op
                    .local_name
                    .ok_or_else(|| format_err!("list without a resolved ctfile"))?;
                self.queue.enqueue(
                    Op::new(Entry::ListData)
                        .action(Action::List)
                        .local_name(local)
                        .filelist(op.filelist)
                        .excludelist(op.excludelist)
                        .matchmode(op.matchmode),
                );
            }
            Action::JustDl => {
                self.fetched = op.local_name;
                self.queue_shutdown();
            }
            Action::Archive => {
                let cachedir = self.cachedir()?.to_string();

                let mut basis = op.local_name;
                if let Some(ref basis_path) = basis {
                    let max = self.config.ctfile_max_differentials;
                    if max > 0 {
                        let name = basis_path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .ok_or_else(|| format_err!("bad basis name"))?;
                        let chain = ctfile::chain_length(&cachedir, name)?;
                        if chain + 1 > max {
                            info!(
                                "differential chain at {} levels, forcing full backup",
                                chain
                            );
                            basis = None;
                        }
                    }
                }

                let tag = op
                    .tag
                    .ok_or_else(|| format_err!("archive without a tag"))?;
                let (fullname, cachepath) =
                    ctfile::find_for_archive(&cachedir, &tag, Local::now())?;
                debug!("backup file is {}", fullname);

                let mut data = Op::new(Entry::ArchiveData)
                    .action(Action::Archive)
                    .local_name(cachepath.clone())
                    .filelist(op.filelist)
                    .excludelist(op.excludelist)
                    .matchmode(op.matchmode);
                if let Some(basis) = basis {
                    data = data.basis(basis);
                }
                self.queue.enqueue(data);
                self.queue.enqueue(
                    Op::new(Entry::CtfileArchive)
                        .local_name(cachepath)
                        .remote_name(fullname),
                );
            }
            Action::None => bail!("invalid action"),
        }
        Ok(())
    }

    /// Continuation of a spliced chain download.
    pub(crate) fn download_next(&mut self, op: Op) -> Result<(), Error> {
        self.stream.is_open = false;
        if let Some(path) = op.local_name {
            self.walk_chain(path)?;
        }
        Ok(())
    }

    /// Follow `previous` pointers from `start`, skipping cached members,
    /// and splice a download for the first missing one. Its completion
    /// re-enters this walk until the chain closes at a full backup.
    fn walk_chain(&mut self, start: PathBuf) -> Result<(), Error> {
        let cachedir = self.cachedir()?.to_string();
        let mut current = start;

        loop {
            debug!("checking chain at {:?}", current);
            let prev = match ctfile::read_previous(&current)? {
                Some(prev) if !prev.is_empty() => prev,
                _ => return Ok(()),
            };

            let cooked = ctfile::cook_name(&prev)?;
            let cachepath = ctfile::cachename(&cachedir, &cooked);
            if ctfile::in_cache(&cachedir, &cooked)? {
                current = cachepath;
                continue;
            }

            debug!("chain member {} not cached, downloading", cooked);
            self.queue.enqueue_next(
                Op::new(Entry::CtfileExtract)
                    .complete(Completion::DownloadNext)
                    .local_name(cachepath)
                    .remote_name(cooked),
            );
            return Ok(());
        }
    }
}
