//! Stream protocols: one module per protocol tag, each holding both ends.
//!
//! Every privileged request carries a signature over some request bytes.
//! Servers recover the requester's address from it and ask the access
//! collaborator before serving anything; a refused request gets a header
//! with `authorized = false` and no payload.

pub mod become_replicator;
pub mod chunk;
pub mod manifest;
pub mod packfile;
pub mod replication;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use swarmgit_core::crypto::{addr_from_signed_hash, Address};
use swarmgit_core::message::DataFrame;
use swarmgit_core::wire::{read_message, write_message, DATA_FRAME_SIZE};
use swarmgit_core::WireError;
use swarmgit_services::{AccessControl, PeerId};

/// Check a signed request against the access list.
///
/// Returns the requester's address when it may pull `repo_id`.
pub(crate) async fn authorize(
    access: &dyn AccessControl,
    peer: PeerId,
    repo_id: &str,
    signed: &[u8],
    signature: &[u8],
) -> Option<Address> {
    let address = match addr_from_signed_hash(signed, signature) {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(%peer, repo = %repo_id, error = %e, "rejecting badly signed request");
            return None;
        }
    };
    match access.address_has_pull_access(&address, repo_id).await {
        Ok(true) => Some(address),
        Ok(false) => {
            tracing::info!(%peer, %address, repo = %repo_id, "pull access denied");
            None
        }
        Err(e) => {
            tracing::warn!(%peer, %address, repo = %repo_id, error = %e, "access check failed");
            None
        }
    }
}

/// Stream `payload` as data frames followed by the end sentinel.
pub(crate) async fn write_frames<W>(writer: &mut W, payload: &Bytes) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + DATA_FRAME_SIZE).min(payload.len());
        write_message(writer, &DataFrame::data(payload.slice(offset..end))).await?;
        offset = end;
    }
    write_message(writer, &DataFrame::end()).await
}

/// Read data frames up to the end sentinel into one buffer.
///
/// Fails if the payload grows past `limit` bytes.
pub(crate) async fn read_frames<R>(reader: &mut R, limit: u64) -> Result<Bytes, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    loop {
        let frame: DataFrame = read_message(reader).await?;
        if frame.end {
            return Ok(buf.freeze());
        }
        if (buf.len() + frame.data.len()) as u64 > limit {
            return Err(WireError::MessageTooLarge(
                (buf.len() + frame.data.len()) as u64,
            ));
        }
        buf.extend_from_slice(&frame.data);
    }
}
