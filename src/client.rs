//! Transport contract.
//!
//! The engine drives any ordered byte stream; establishing the TLS session
//! (and authenticating it) is the embedder's concern.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::protocol::{
    CtrlMsg, CtrlReply, Frame, FrameCodec, FrameHeader, HeaderFlags, Opcode, STATUS_OK,
};

/// Connected byte stream carrying the framed protocol.
pub trait Transport: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> Transport for T {}

/// Timeout for the polled open exchange.
pub const OPEN_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Synchronous remote open performed outside the event loop, used during
/// startup before the async pump is running. Reuses the previous packet id
/// so the server side state machine stays aligned.
pub async fn open_polled<T: Transport>(
    transport: &mut T,
    name: &str,
    write: bool,
    chunkno: Option<u32>,
    packet_id: u64,
) -> Result<(), Error> {
    let msg = if write {
        CtrlMsg::MdOpenCreate {
            name: name.to_string(),
            chunkno,
        }
    } else {
        CtrlMsg::MdOpenRead {
            name: name.to_string(),
            chunkno,
        }
    };

    let header = FrameHeader::new(
        Opcode::Xml,
        HeaderFlags::METADATA,
        packet_id.wrapping_sub(1),
    );
    let frame = Frame::new(header, msg.render().into());

    let mut framed = Framed::new(transport, FrameCodec::new());

    tokio::time::timeout(OPEN_POLL_TIMEOUT, framed.send(frame))
        .await
        .map_err(|_| format_err!("timed out writing open request for '{}'", name))??;

    let reply = tokio::time::timeout(OPEN_POLL_TIMEOUT, framed.next())
        .await
        .map_err(|_| format_err!("timed out waiting for open reply for '{}'", name))?
        .ok_or_else(|| format_err!("connection closed during open of '{}'", name))??;

    if reply.header.opcode != Opcode::XmlReply || reply.header.status != STATUS_OK {
        bail!("remote open of '{}' failed", name);
    }

    match CtrlReply::parse(&reply.body)? {
        CtrlReply::Opened { name: Some(_) } => Ok(()),
        CtrlReply::Opened { name: None } => bail!("remote file '{}' does not exist", name),
        other => bail!("unexpected reply to open of '{}': {:?}", name, other),
    }
}
