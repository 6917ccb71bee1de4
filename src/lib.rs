//! Client engine for a content-addressed, encrypted, deduplicating
//! remote backup service.
//!
//! Backups are described by *ctfiles* (catalogue files holding directory
//! metadata plus an ordered list of content-chunk hashes). This crate
//! implements the client side of the catalogue plane: uploading and
//! downloading ctfiles over a framed wire protocol, resolving differential
//! chains, keeping the passphrase-protected crypto secrets file in sync
//! with the server, and driving the cull dialog that lets the server
//! garbage collect unreferenced chunks.
//!
//! The data plane (chunking file trees into content hashes and
//! rehydrating them) and the TLS transport are collaborators supplied by
//! the embedder, see [engine::DataOps] and [client::Transport].

pub mod tools;

pub mod config;

pub mod client;

pub mod protocol;

pub mod ctfile;

pub mod engine;
