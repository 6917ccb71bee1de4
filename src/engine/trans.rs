use std::sync::Arc;

use crate::protocol::HeaderFlags;

/// Largest chunk of a ctfile moved by one transaction.
pub const MAX_BLOCK_SIZE: usize = 256 * 1024;

/// Payload buffers per transaction.
pub const PAYLOAD_SLOTS: usize = 3;
/// Slot carrying chunk bytes.
pub const DATA_SLOT: usize = 0;
/// Slot carrying rendered control documents.
pub const XML_SLOT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransKind {
    ReadChunk,
    WriteChunk,
    XmlCtrl,
}

/// Where a transaction stands in its lifecycle; replies are dispatched on
/// this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    /// Chunk read from the local ctfile, queued for upload.
    Read,
    /// Chunk requested from the remote ctfile.
    ExSha,
    XmlOpen,
    XmlClose,
    XmlList,
    XmlDelete,
    XmlCullSend,
    Done,
}

/// Derive the deterministic per-chunk iv: the chunk ordinal little-endian,
/// twice, into the first 8 bytes; the remainder zero. The server can
/// recreate decryption context from the chunk number alone.
pub fn chunk_iv(chunk_no: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..4].copy_from_slice(&chunk_no.to_le_bytes());
    iv[4..8].copy_from_slice(&chunk_no.to_le_bytes());
    iv
}

/// For extract requests the leading hash bytes address the chunk within
/// the remote ctfile index.
pub fn chunk_sha(chunk_no: u32) -> [u8; 20] {
    let mut sha = [0u8; 20];
    sha[0..4].copy_from_slice(&chunk_no.to_le_bytes());
    sha
}

/// In-flight transfer descriptor, drawn from the bounded [TransPool].
#[derive(Debug)]
pub struct Trans {
    pub trans_id: u64,
    pub state: TransState,
    pub kind: TransKind,
    pub flags: HeaderFlags,
    pub chunk_no: u32,
    pub iv: [u8; 16],
    pub sha: [u8; 20],
    /// Active payload slot.
    pub slot: usize,
    /// Valid bytes in the active slot.
    pub len: usize,
    /// Last transaction of a stream.
    pub eof: bool,
    /// Remote tag, shared across all transactions of one stream.
    pub ctfile_name: Option<Arc<str>>,
    data: [Vec<u8>; PAYLOAD_SLOTS],
}

impl Trans {
    fn new() -> Self {
        Self {
            trans_id: 0,
            state: TransState::Done,
            kind: TransKind::XmlCtrl,
            flags: HeaderFlags::empty(),
            chunk_no: 0,
            iv: [0u8; 16],
            sha: [0u8; 20],
            slot: DATA_SLOT,
            len: 0,
            eof: false,
            ctfile_name: None,
            // the chunk slot is sized once and reused for every chunk
            data: [vec![0u8; MAX_BLOCK_SIZE], Vec::new(), Vec::new()],
        }
    }

    fn reset(&mut self) {
        self.state = TransState::Done;
        self.kind = TransKind::XmlCtrl;
        self.flags = HeaderFlags::empty();
        self.chunk_no = 0;
        self.iv = [0u8; 16];
        self.sha = [0u8; 20];
        self.slot = DATA_SLOT;
        self.len = 0;
        self.eof = false;
        self.ctfile_name = None;
        self.data[XML_SLOT].clear();
        if self.data[DATA_SLOT].len() != MAX_BLOCK_SIZE {
            self.data[DATA_SLOT].resize(MAX_BLOCK_SIZE, 0);
        }
    }

    /// The valid payload bytes of the active slot.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.slot][..self.len]
    }

    /// The full chunk buffer, for filling.
    pub fn chunk_buffer(&mut self) -> &mut [u8] {
        &mut self.data[DATA_SLOT][..]
    }

    /// Stash a rendered control document.
    pub fn set_ctrl_body(&mut self, body: Vec<u8>) {
        self.slot = XML_SLOT;
        self.len = body.len();
        self.data[XML_SLOT] = body;
    }
}

/// Fixed-capacity pool of transactions. Allocation is non-blocking; on
/// exhaustion the producer parks itself in `WAITING_TRANS` and is rewoken
/// when a transaction is released.
pub struct TransPool {
    free: Vec<Trans>,
    capacity: usize,
    outstanding: usize,
    next_id: u64,
}

impl TransPool {
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Trans::new());
        }
        Self {
            free,
            capacity,
            outstanding: 0,
            next_id: 0,
        }
    }

    /// Grab a transaction, or `None` when the pool is exhausted.
    pub fn alloc(&mut self) -> Option<Trans> {
        let mut trans = self.free.pop()?;
        trans.reset();
        trans.trans_id = self.next_id;
        self.next_id += 1;
        self.outstanding += 1;
        Some(trans)
    }

    pub fn release(&mut self, trans: Trans) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
        self.free.push(trans);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
