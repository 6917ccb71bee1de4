//! The ctfile transfer state machine.
//!
//! One stream (archive or extract) is active at a time; its whole state
//! lives in the [StreamContext] owned by the engine and cleared between
//! operations. Producers submit as many chunk transactions as the pool
//! allows, then yield; replies and pool releases wake them again.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use anyhow::{format_err, Error};
use log::{debug, warn};

use crate::client::Transport;
use crate::ctfile;
use crate::protocol::{CtrlMsg, HeaderFlags};

use super::core::Engine;
use super::{chunk_iv, chunk_sha, FileState, TransKind, TransState, MAX_BLOCK_SIZE};

/// State of the open ctfile stream. Invariant: `!is_open || !open_inflight`.
pub(crate) struct StreamContext {
    pub handle: Option<File>,
    pub size: u64,
    pub offset: u64,
    pub block_no: u32,
    /// Server acknowledged the open.
    pub is_open: bool,
    /// Open request issued, not yet acknowledged.
    pub open_inflight: bool,
    /// Remote tag shared by every transaction of this stream.
    pub remote_name: Option<Arc<str>>,
}

impl StreamContext {
    pub fn new() -> Self {
        Self {
            handle: None,
            size: 0,
            offset: 0,
            block_no: 0,
            is_open: false,
            open_inflight: false,
            remote_name: None,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl<T: Transport> Engine<T> {
    /// Upload the current op's local ctfile to the server.
    pub(crate) fn ctfile_archive_step(&mut self) -> Result<(), Error> {
        self.file_state = FileState::Running;
        debug!("archive step, block {}", self.stream.block_no);

        loop {
            let mut trans = match self.alloc_trans() {
                Some(trans) => trans,
                None => return Ok(()),
            };

            if !self.stream.is_open {
                if self.stream.open_inflight {
                    debug!("waiting on remote open");
                    self.release_trans(trans);
                    self.file_state = FileState::WaitingTrans;
                    return Ok(());
                }

                let local = self
                    .current_op()
                    .local_name
                    .clone()
                    .ok_or_else(|| format_err!("archive without a local ctfile"))?;
                debug!("opening ctfile for archive {:?}", local);
                let handle = File::open(&local)
                    .map_err(|err| format_err!("can't open {:?} for reading - {}", local, err))?;
                let meta = handle
                    .metadata()
                    .map_err(|err| format_err!("can't stat backup file {:?} - {}", local, err))?;

                self.stream.handle = Some(handle);
                self.stream.size = meta.len();
                self.stream.offset = 0;
                self.stream.block_no = 0;

                let remote: Arc<str> = match self.current_op().remote_name.as_deref() {
                    Some(name) => Arc::from(name),
                    None => {
                        let cooked = ctfile::cook_name(&local.to_string_lossy())?;
                        Arc::from(cooked.as_str())
                    }
                };
                self.stream.remote_name = Some(remote.clone());

                trans.kind = TransKind::XmlCtrl;
                trans.state = TransState::XmlOpen;
                trans.flags = HeaderFlags::METADATA;
                trans.ctfile_name = Some(remote.clone());
                trans.set_ctrl_body(
                    CtrlMsg::MdOpenCreate {
                        name: remote.to_string(),
                        chunkno: None,
                    }
                    .render(),
                );
                self.stream.open_inflight = true;
                self.submit_trans(trans);
                return Ok(());
            }

            if self.stream.offset == self.stream.size {
                debug!("eof reached, closing remote file");
                // drop closes the local handle
                self.stream.handle = None;

                trans.kind = TransKind::XmlCtrl;
                trans.state = TransState::XmlClose;
                trans.flags = HeaderFlags::METADATA;
                trans.eof = true;
                trans.ctfile_name = self.stream.remote_name.clone();
                trans.set_ctrl_body(CtrlMsg::MdClose.render());

                self.stats.bytes_tot += self.stream.size;
                self.file_state = FileState::Finished;
                self.submit_trans(trans);
                return Ok(());
            }

            let want = (self.stream.size - self.stream.offset).min(MAX_BLOCK_SIZE as u64) as usize;
            let handle = self
                .stream
                .handle
                .as_mut()
                .ok_or_else(|| format_err!("archive stream without an open file"))?;
            let got = handle
                .read(&mut trans.chunk_buffer()[..want])
                .map_err(|err| format_err!("read from ctfile failed - {}", err))?;

            let at_eof = got != want || (self.stream.offset + got as u64) == self.stream.size;
            if at_eof {
                // short read, file truncated or EOF
                match handle.metadata() {
                    Err(err) => warn!("file stat error during archive - {}", err),
                    Ok(meta) if meta.len() != self.stream.size => {
                        warn!("file truncated during backup")
                    }
                    Ok(_) => {}
                }
            }

            self.stats.bytes_read += got as u64;

            let block_no = self.stream.block_no;
            trans.kind = TransKind::WriteChunk;
            trans.state = TransState::Read;
            trans.flags = HeaderFlags::METADATA;
            trans.chunk_no = block_no;
            trans.iv = chunk_iv(block_no);
            trans.sha = chunk_sha(block_no);
            trans.slot = super::DATA_SLOT;
            trans.len = got;
            trans.ctfile_name = self.stream.remote_name.clone();

            self.stream.block_no += 1;

            if at_eof {
                self.stream.offset = self.stream.size;
            } else {
                self.stream.offset += got as u64;
            }

            self.submit_trans(trans);
        }
    }

    /// Download the current op's remote ctfile into the local file.
    pub(crate) fn ctfile_extract_step(&mut self) -> Result<(), Error> {
        self.file_state = FileState::Running;

        loop {
            let mut trans = match self.alloc_trans() {
                Some(trans) => trans,
                None => return Ok(()),
            };

            if !self.stream.is_open {
                if self.stream.open_inflight {
                    debug!("waiting on remote open");
                    self.release_trans(trans);
                    self.file_state = FileState::WaitingTrans;
                    return Ok(());
                }

                // may have been opened for us already (secrets tmp file)
                if self.stream.handle.is_none() {
                    let local = self
                        .current_op()
                        .local_name
                        .clone()
                        .ok_or_else(|| format_err!("extract without a local ctfile"))?;
                    debug!("opening {:?} for extract", local);
                    let handle = File::create(&local)
                        .map_err(|err| format_err!("unable to open file {:?} - {}", local, err))?;
                    self.stream.handle = Some(handle);
                }
                self.stream.block_no = 0;

                let remote: Arc<str> = {
                    let op = self.current_op();
                    match op.remote_name.as_deref() {
                        Some(name) => Arc::from(name),
                        None => {
                            let local = op
                                .local_name
                                .as_ref()
                                .ok_or_else(|| format_err!("extract without a name"))?;
                            Arc::from(ctfile::cook_name(&local.to_string_lossy())?.as_str())
                        }
                    }
                };
                self.stream.remote_name = Some(remote.clone());

                trans.kind = TransKind::XmlCtrl;
                trans.state = TransState::XmlOpen;
                trans.flags = HeaderFlags::METADATA;
                trans.ctfile_name = Some(remote.clone());
                trans.set_ctrl_body(
                    CtrlMsg::MdOpenRead {
                        name: remote.to_string(),
                        chunkno: None,
                    }
                    .render(),
                );
                self.stream.open_inflight = true;
                self.submit_trans(trans);
                return Ok(());
            }

            let block_no = self.stream.block_no;
            trans.kind = TransKind::ReadChunk;
            trans.state = TransState::ExSha;
            trans.flags = HeaderFlags::METADATA;
            trans.chunk_no = block_no;
            trans.sha = chunk_sha(block_no);
            trans.iv = chunk_iv(block_no);
            trans.slot = super::DATA_SLOT;
            trans.len = 0;
            trans.ctfile_name = self.stream.remote_name.clone();

            self.stream.block_no += 1;
            self.submit_trans(trans);
        }
    }

    /// The server signaled end of stream on an extract: close the local
    /// file and finish the dialog.
    pub(crate) fn end_extract_stream(&mut self) -> Result<(), Error> {
        debug!("eof reached, closing file");
        self.stream.handle = None;
        self.file_state = FileState::Finished;

        let mut trans = self
            .alloc_trans()
            .ok_or_else(|| format_err!("no transaction available for close"))?;
        trans.kind = TransKind::XmlCtrl;
        trans.state = TransState::XmlClose;
        trans.flags = HeaderFlags::METADATA;
        trans.eof = true;
        trans.ctfile_name = self.stream.remote_name.clone();
        trans.set_ctrl_body(CtrlMsg::MdClose.render());
        self.submit_trans(trans);
        Ok(())
    }
}
