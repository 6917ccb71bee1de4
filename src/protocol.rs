//! The framed wire protocol.
//!
//! Every packet is a fixed-size binary header followed by `size` body
//! bytes. Chunk payloads travel as opaque binary bodies; control messages
//! are small XML documents from a closed vocabulary.
//!
//! Body layout per opcode:
//!
//! * `DATA` (chunk write): 20 byte sha, 16 byte iv, then the chunk bytes.
//!   The reply echoes the tag with an empty body.
//! * `READ` (chunk read): 20 byte sha, 16 byte iv. The reply body is the
//!   chunk bytes; a non-OK status signals end of stream.
//! * `XML`: an XML control document. The reply arrives as `XML_REPLY`.

mod header;
pub use header::*;

mod xml;
pub use xml::*;
