use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio_util::codec::Framed;

use crate::client::Transport;
use crate::config::{Config, CtfileMode, SessionCompression};
use crate::ctfile::{self, CtfileListEntry};
use crate::protocol::{
    CtrlReply, Frame, FrameCodec, FrameHeader, HeaderFlags, Opcode, FRAME_HEADER_LEN, STATUS_OK,
};

use super::secrets::SecretsCrypto;
use super::stream::StreamContext;
use super::{
    Completion, DataOps, Entry, FileState, Op, OpQueue, Stats, Trans, TransKind, TransPool,
    TransState,
};

/// Scratch state of an in-progress cull.
#[derive(Default)]
pub(crate) struct CullState {
    pub uuid: Option<u64>,
    pub shas: BTreeSet<[u8; 20]>,
    pub files: BTreeMap<String, CtfileListEntry>,
    pub sent_complete: bool,
}

/// Simple send-side bandwidth accounting.
pub(crate) struct Throttle {
    rate: u64,
    started: Instant,
    sent: u64,
}

impl Throttle {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            started: Instant::now(),
            sent: 0,
        }
    }

    async fn consume(&mut self, bytes: usize) {
        if self.rate == 0 {
            return;
        }
        self.sent += bytes as u64;
        let due = Duration::from_secs_f64(self.sent as f64 / self.rate as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }
}

/// The engine: one cooperative event loop over a framed transport.
///
/// Operations are queued up front (or spliced in by continuations), then
/// [Engine::run] drives the whole queue to completion. The engine is
/// single-threaded by design; there is no shared mutable state and no
/// locking.
pub struct Engine<T: Transport> {
    framed: Framed<T, FrameCodec>,
    pub(crate) config: Config,
    pub(crate) pool: TransPool,
    pub(crate) queue: OpQueue,
    pub(crate) current: Option<Op>,
    pub(crate) file_state: FileState,
    pub(crate) wake_pending: bool,
    pub(crate) current_done: bool,
    pub(crate) shutting_down: bool,
    pub(crate) stream: StreamContext,
    /// Handle pre-opened for the next extract op (secrets download).
    pub(crate) pending_handle: Option<std::fs::File>,
    pub(crate) submit: VecDeque<Trans>,
    pub(crate) inflight: BTreeMap<u64, Trans>,
    /// Raw results of the currently running list op.
    pub(crate) list_accum: Vec<CtfileListEntry>,
    /// Filtered results stashed for the embedder.
    pub(crate) list_results: Vec<CtfileListEntry>,
    pub(crate) cull: CullState,
    pub(crate) stats: Stats,
    pub(crate) data_ops: Option<Box<dyn DataOps>>,
    pub(crate) secrets: Option<Box<dyn SecretsCrypto>>,
    /// Final cache path of a fetch-only (JUSTDL) workflow.
    pub(crate) fetched: Option<PathBuf>,
    throttle: Throttle,
    session_flags: HeaderFlags,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, mut config: Config) -> Result<Self, Error> {
        config.prepare_cachedir()?;

        let session_flags = match config.session_compression {
            Some(SessionCompression::Lzo) => HeaderFlags::COMP_LZO,
            Some(SessionCompression::Lzma) => HeaderFlags::COMP_LZMA,
            Some(SessionCompression::Lzw) => HeaderFlags::COMP_LZW,
            None => HeaderFlags::empty(),
        };

        Ok(Self {
            framed: Framed::new(transport, FrameCodec::new()),
            pool: TransPool::new(config.queue_depth),
            throttle: Throttle::new(config.bandwidth),
            config,
            queue: OpQueue::new(),
            current: None,
            file_state: FileState::Running,
            wake_pending: false,
            current_done: false,
            shutting_down: false,
            stream: StreamContext::new(),
            pending_handle: None,
            submit: VecDeque::new(),
            inflight: BTreeMap::new(),
            list_accum: Vec::new(),
            list_results: Vec::new(),
            cull: CullState::default(),
            stats: Stats::default(),
            data_ops: None,
            secrets: None,
            fetched: None,
            session_flags,
        })
    }

    /// Attach the data plane collaborator.
    pub fn with_data_ops(mut self, data_ops: Box<dyn DataOps>) -> Self {
        self.data_ops = Some(data_ops);
        self
    }

    /// Attach the secrets-file crypto collaborator.
    pub fn with_secrets(mut self, secrets: Box<dyn SecretsCrypto>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Results of the last completed remote listing.
    pub fn take_list_results(&mut self) -> Vec<CtfileListEntry> {
        std::mem::take(&mut self.list_results)
    }

    /// Cache path the last fetch-only workflow landed in.
    pub fn fetched(&self) -> Option<&Path> {
        self.fetched.as_deref()
    }

    /// Append a shutdown op; when it is reached the loop stops.
    pub fn queue_shutdown(&mut self) {
        self.queue.enqueue(Op::new(Entry::Shutdown));
    }

    pub(crate) fn cachedir(&self) -> Result<&str, Error> {
        self.config
            .ctfile_cachedir
            .as_deref()
            .ok_or_else(|| format_err!("no ctfile cache directory configured"))
    }

    pub(crate) fn require_remote(&self) -> Result<(), Error> {
        if self.config.ctfile_mode != CtfileMode::Remote {
            bail!("operation requires ctfile_mode = remote");
        }
        Ok(())
    }

    pub(crate) fn current_op(&self) -> &Op {
        self.current.as_ref().expect("no current operation")
    }

    pub(crate) fn wake(&mut self) {
        self.wake_pending = true;
    }

    /// Grab a transaction; on exhaustion park the producer.
    pub(crate) fn alloc_trans(&mut self) -> Option<Trans> {
        match self.pool.alloc() {
            Some(trans) => Some(trans),
            None => {
                debug!("ran out of transactions, waiting");
                self.file_state = FileState::WaitingTrans;
                None
            }
        }
    }

    pub(crate) fn release_trans(&mut self, trans: Trans) {
        self.pool.release(trans);
        self.wake();
    }

    pub(crate) fn submit_trans(&mut self, trans: Trans) {
        self.submit.push_back(trans);
    }

    /// Drive every queued operation to completion.
    pub async fn run(&mut self) -> Result<(), Error> {
        if self.current.is_none() {
            self.advance()?;
        }

        while self.current.is_some() {
            self.pump()?;
            self.flush_submit().await?;

            if self.current_done {
                self.current_done = false;
                self.advance()?;
                continue;
            }

            if self.inflight.is_empty() {
                bail!(
                    "engine stalled in {:?} with nothing in flight",
                    self.file_state
                );
            }

            let frame = match self.framed.next().await {
                Some(frame) => frame?,
                None => bail!("connection closed unexpectedly"),
            };
            self.handle_frame(frame)?;
        }

        self.trim_cache();
        self.stats.log_summary();
        Ok(())
    }

    /// Re-enter the current producer while it has a pending wakeup.
    fn pump(&mut self) -> Result<(), Error> {
        while self.wake_pending && self.current.is_some() && !self.current_done {
            self.wake_pending = false;
            if self.file_state == FileState::Finished {
                break;
            }
            self.dispatch_entry()?;
        }
        Ok(())
    }

    fn dispatch_entry(&mut self) -> Result<(), Error> {
        match self.current_op().entry {
            Entry::CtfileArchive => self.ctfile_archive_step(),
            Entry::CtfileExtract => self.ctfile_extract_step(),
            Entry::CtfileList => self.ctfile_list_start(),
            Entry::CtfileDelete => self.ctfile_delete_start(),
            Entry::ArchiveData | Entry::ExtractData | Entry::ListData => self.data_op_step(),
            Entry::CullCollect => self.cull_collect(),
            Entry::CullSetup => self.cull_setup(),
            Entry::CullShas => self.cull_send_shas(),
            Entry::CullComplete => self.cull_send_complete(),
            Entry::Shutdown => {
                debug!("shutdown op reached, draining");
                self.shutting_down = true;
                self.file_state = FileState::Finished;
                self.current_done = true;
                Ok(())
            }
        }
    }

    /// Run the completed op's continuation, then dispatch the next op.
    fn advance(&mut self) -> Result<(), Error> {
        if let Some(op) = self.current.take() {
            self.run_completion(op)?;
        }

        if self.shutting_down {
            self.queue.clear();
            return Ok(());
        }

        if let Some(op) = self.queue.pop() {
            debug!("dispatching {:?} (queue depth {})", op.entry, self.queue.len());
            self.stream.clear();
            if let Some(handle) = self.pending_handle.take() {
                self.stream.handle = Some(handle);
            }
            self.file_state = FileState::Running;
            self.wake_pending = true;
            self.current_done = false;
            self.current = Some(op);
        }
        Ok(())
    }

    fn run_completion(&mut self, op: Op) -> Result<(), Error> {
        match op.complete {
            Completion::None => Ok(()),
            Completion::FindForExtract => self.find_for_extract_complete(op),
            Completion::ExtractNextop => self.extract_nextop(op),
            Completion::DownloadNext => self.download_next(op),
            Completion::StoreList => self.store_list_complete(op),
            Completion::SecretsCheck => self.secrets_check_complete(op),
            Completion::SecretsUnlock => self.secrets_unlock_complete(op),
            Completion::CullFetchAll => self.cull_fetch_all_complete(op),
            Completion::CullDone => self.cull_done(op),
        }
    }

    /// Dispatch a data-plane op to the collaborator.
    fn data_op_step(&mut self) -> Result<(), Error> {
        let op = self.current.as_ref().expect("no current operation");
        let entry = op.entry;
        let local = op
            .local_name
            .clone()
            .ok_or_else(|| format_err!("data op without a ctfile"))?;
        let filelist = op.filelist.clone();
        let excludelist = op.excludelist.clone();
        let matchmode = op.matchmode;
        let basis = op.basis.clone();

        let data_ops = self
            .data_ops
            .as_mut()
            .ok_or_else(|| format_err!("no data plane configured"))?;

        match entry {
            Entry::ArchiveData => {
                data_ops.archive(&local, &filelist, &excludelist, basis.as_deref())?
            }
            Entry::ExtractData => data_ops.extract(&local, &filelist, &excludelist)?,
            Entry::ListData => data_ops.list(&local, &filelist, &excludelist, matchmode)?,
            _ => unreachable!("not a data op"),
        }

        self.file_state = FileState::Finished;
        self.current_done = true;
        Ok(())
    }

    /// Encode and send everything the producers queued.
    async fn flush_submit(&mut self) -> Result<(), Error> {
        while let Some(trans) = self.submit.pop_front() {
            let (opcode, body) = match trans.kind {
                TransKind::WriteChunk => {
                    let payload = trans.payload();
                    let mut body = BytesMut::with_capacity(36 + payload.len());
                    body.put_slice(&trans.sha);
                    body.put_slice(&trans.iv);
                    body.put_slice(payload);
                    (Opcode::Data, body.freeze())
                }
                TransKind::ReadChunk => {
                    let mut body = BytesMut::with_capacity(36);
                    body.put_slice(&trans.sha);
                    body.put_slice(&trans.iv);
                    (Opcode::Read, body.freeze())
                }
                TransKind::XmlCtrl => (Opcode::Xml, Bytes::copy_from_slice(trans.payload())),
            };

            let mut flags = trans.flags;
            if trans.kind == TransKind::WriteChunk {
                flags |= self.session_flags;
            }

            let header = FrameHeader::new(opcode, flags, trans.trans_id);
            let nbytes = FRAME_HEADER_LEN + body.len();

            debug!(
                "send trans {} {:?} ({} body bytes)",
                trans.trans_id,
                trans.kind,
                body.len()
            );

            self.inflight.insert(trans.trans_id, trans);
            self.framed.send(Frame::new(header, body)).await?;
            self.throttle.consume(nbytes).await;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let Frame { header, body } = frame;
        let trans = self
            .inflight
            .remove(&header.tag)
            .ok_or_else(|| format_err!("reply for unknown transaction {}", header.tag))?;

        match header.opcode {
            Opcode::Data => {
                if header.status != STATUS_OK {
                    bail!(
                        "chunk {} write rejected by server (status {})",
                        trans.chunk_no,
                        header.status
                    );
                }
                self.stats.bytes_sent += trans.len as u64;
                self.release_trans(trans);
            }
            Opcode::Read => {
                if header.status == STATUS_OK {
                    let handle = self
                        .stream
                        .handle
                        .as_mut()
                        .ok_or_else(|| format_err!("chunk reply without an open stream"))?;
                    handle.write_all(&body)?;
                    self.stats.bytes_recv += body.len() as u64;
                    self.release_trans(trans);
                } else {
                    // end of stream; the first such reply closes the file
                    self.release_trans(trans);
                    if self.stream.handle.is_some() {
                        self.end_extract_stream()?;
                    }
                }
            }
            Opcode::XmlReply => {
                if header.status != STATUS_OK {
                    bail!("control exchange failed (status {})", header.status);
                }
                self.handle_xml_reply(trans, &body)?;
            }
            Opcode::Xml => bail!("unexpected opcode from server"),
        }
        Ok(())
    }

    fn handle_xml_reply(&mut self, trans: Trans, body: &[u8]) -> Result<(), Error> {
        let reply = CtrlReply::parse(body)?;
        match reply {
            CtrlReply::Opened { name } => match name {
                Some(name) => {
                    debug!("{} opened", name);
                    self.stream.is_open = true;
                    self.stream.open_inflight = false;
                    self.release_trans(trans);
                }
                None => {
                    let wanted = self
                        .stream
                        .remote_name
                        .as_deref()
                        .unwrap_or("(unknown)")
                        .to_string();
                    bail!("couldn't open remote file '{}'", wanted);
                }
            },
            CtrlReply::Closed => {
                debug!("remote file closed");
                self.stream.is_open = false;
                self.release_trans(trans);
                self.current_done = true;
            }
            CtrlReply::List { files } => {
                self.list_accum
                    .extend(files.into_iter().map(CtfileListEntry::from));
                self.release_trans(trans);
                self.current_done = true;
            }
            CtrlReply::Deleted { name } => {
                match name {
                    Some(name) => info!("{} deleted", name),
                    None => warn!("specified archive does not exist"),
                }
                self.release_trans(trans);
                self.current_done = true;
            }
            CtrlReply::CullSetupOk => {
                debug!("cull setup acknowledged");
                self.release_trans(trans);
                self.current_done = true;
            }
            CtrlReply::CullShasOk => {
                let eof = trans.eof;
                self.release_trans(trans);
                if eof {
                    self.current_done = true;
                }
                // the wakeup from the release sends the next batch
            }
            CtrlReply::CullCompleteOk => {
                debug!("cull complete acknowledged");
                self.release_trans(trans);
                self.current_done = true;
            }
        }
        Ok(())
    }

    /// Best-effort cache trim once the queue drained.
    fn trim_cache(&mut self) {
        if self.config.ctfile_mode != CtfileMode::Remote {
            return;
        }
        if self.config.ctfile_cachedir_max_size == u64::MAX {
            return;
        }
        let cachedir = match self.config.ctfile_cachedir.as_deref() {
            Some(dir) => dir,
            None => return,
        };
        match ctfile::trim(cachedir, self.config.ctfile_cachedir_max_size) {
            Ok(removed) => {
                for name in removed {
                    info!("cache over size limit, dropped {}", name);
                }
            }
            Err(err) => warn!("cache trim failed - {}", err),
        }
    }

    /// Filter the accumulated listing with the op's search patterns.
    pub(crate) fn take_listing(
        &mut self,
        op: &Op,
    ) -> Result<BTreeMap<String, CtfileListEntry>, Error> {
        let raw = std::mem::take(&mut self.list_accum);
        ctfile::filter_results(raw, op.search_mode, &op.search, &[])
    }

    /// Stash filtered results for the embedder (remote listing command).
    fn store_list_complete(&mut self, op: Op) -> Result<(), Error> {
        let results = self.take_listing(&op)?;
        self.list_results = results.into_iter().map(|(_, entry)| entry).collect();
        Ok(())
    }
}

/// Remote listing: ask for everything, filter client side.
impl<T: Transport> Engine<T> {
    pub(crate) fn ctfile_list_start(&mut self) -> Result<(), Error> {
        self.file_state = FileState::Finished;
        let mut trans = match self.alloc_trans() {
            Some(trans) => trans,
            None => return Ok(()),
        };
        trans.kind = TransKind::XmlCtrl;
        trans.state = TransState::XmlList;
        trans.flags = HeaderFlags::METADATA;
        trans.set_ctrl_body(crate::protocol::CtrlMsg::MdList.render());
        self.submit_trans(trans);
        Ok(())
    }

    pub(crate) fn ctfile_delete_start(&mut self) -> Result<(), Error> {
        let remote = self
            .current_op()
            .remote_name
            .clone()
            .ok_or_else(|| format_err!("delete without a remote name"))?;
        let remote = ctfile::cook_name(&remote)?;

        self.file_state = FileState::Finished;
        let mut trans = match self.alloc_trans() {
            Some(trans) => trans,
            None => {
                self.file_state = FileState::WaitingTrans;
                return Ok(());
            }
        };
        trans.kind = TransKind::XmlCtrl;
        trans.state = TransState::XmlDelete;
        trans.flags = HeaderFlags::METADATA;
        trans.set_ctrl_body(crate::protocol::CtrlMsg::MdDelete { name: remote }.render());
        self.submit_trans(trans);
        Ok(())
    }
}
