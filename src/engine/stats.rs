use log::info;

/// Session byte counters, reported once the queue drains.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Total ctfile bytes scheduled for upload.
    pub bytes_tot: u64,
    /// Bytes read from local ctfiles.
    pub bytes_read: u64,
    /// Chunk bytes put on the wire.
    pub bytes_sent: u64,
    /// Chunk bytes received from the server.
    pub bytes_recv: u64,
    /// Precious hashes declared during cull.
    pub sha_count: u64,
    /// Rendered size of the cull sha documents.
    pub sha_payload: u64,
}

impl Stats {
    pub(crate) fn log_summary(&self) {
        info!(
            "session done: {} bytes up, {} bytes down ({} scheduled)",
            self.bytes_sent, self.bytes_recv, self.bytes_tot
        );
        if self.sha_count > 0 {
            info!(
                "cull: {} precious hashes in {} payload bytes",
                self.sha_count, self.sha_payload
            );
        }
    }
}
