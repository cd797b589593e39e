//! Activation / gradient transfers for pipeline parallelism.
//!
//! Wraps [`Transport`] with a tag scheme that distinguishes forward from
//! backward traffic per receiving stage and micro-batch, and one execution
//! attempt from the next:
//!
//! `tag = epoch << 32 | (to_stage * num_micro_batches + mb_id) * 2 + is_backward`
//!
//! Keying on the receiving logical stage keeps virtual stages apart when two
//! ranks exchange both activations and gradients (P=2 with interleaving).
//! The epoch keeps payloads of an aborted attempt from matching a later one.

use std::time::Duration;

use super::schedule::{Transfer, TransferKind};
use crate::distributed::transport::{Transport, TransportError};
use crate::error::{Error, Result};

/// Compute the communication tag for a transfer sent in `epoch`.
pub fn transfer_tag(transfer: &Transfer, num_micro_batches: usize, epoch: u32) -> Result<u64> {
    let mb_id = transfer.microbatch;
    let is_backward = match transfer.kind {
        TransferKind::Activation => 0,
        TransferKind::Gradient => 1,
        TransferKind::Fingerprint => {
            return Err(Error::config("transfer", "fingerprints are not pipeline transfers"));
        }
    };
    let offset = transfer
        .to
        .logical
        .checked_mul(num_micro_batches)
        .and_then(|v| v.checked_add(mb_id))
        .and_then(|v| v.checked_mul(2))
        .and_then(|v| v.checked_add(is_backward))
        .ok_or_else(|| Error::config("num_microbatches", format!("micro-batch id {mb_id} overflows tag range")))?;
    let offset = u32::try_from(offset)
        .map_err(|_| Error::config("num_microbatches", format!("tag overflow for mb_id={mb_id}")))?;
    Ok(epoch_tag(epoch, offset))
}

/// Place `base` in the tag space of `epoch`.
pub fn epoch_tag(epoch: u32, base: u32) -> u64 {
    (u64::from(epoch) << 32) | u64::from(base)
}

/// Epoch a tag was sent in.
pub fn tag_epoch(tag: u64) -> u32 {
    (tag >> 32) as u32
}

/// Whether `tag` belongs to an epoch before `current`.
///
/// Epochs wrap; anything up to 2^31 epochs behind counts as older, so
/// traffic from a peer already one attempt ahead is kept.
pub fn is_stale(tag: u64, current: u32) -> bool {
    (current.wrapping_sub(tag_epoch(tag)) as i32) > 0
}

/// Send a transfer's payload to `dest`.
pub fn send_transfer<T, X: Transport<T> + ?Sized>(
    transport: &mut X,
    dest: usize,
    transfer: &Transfer,
    num_micro_batches: usize,
    epoch: u32,
    payload: T,
) -> Result<()> {
    let tag = transfer_tag(transfer, num_micro_batches, epoch)?;
    let rank = transport.rank();
    transport
        .send(dest, tag, payload)
        .map_err(|e| transport_error(rank, dest, transfer, e, Duration::ZERO))
}

/// Receive a transfer's payload from `src`, blocking up to `timeout`.
///
/// A timeout is surfaced as [`Error::StallTimeout`]; it is not retried.
pub fn recv_transfer<T, X: Transport<T> + ?Sized>(
    transport: &mut X,
    src: usize,
    transfer: &Transfer,
    num_micro_batches: usize,
    epoch: u32,
    timeout: Duration,
) -> Result<T> {
    let tag = transfer_tag(transfer, num_micro_batches, epoch)?;
    let rank = transport.rank();
    transport
        .recv(src, tag, timeout)
        .map_err(|e| transport_error(rank, src, transfer, e, timeout))
}

fn transport_error(
    rank: usize,
    peer: usize,
    transfer: &Transfer,
    err: TransportError,
    timeout: Duration,
) -> Error {
    match err {
        TransportError::Timeout(_) => Error::StallTimeout {
            rank,
            peer,
            microbatch: Some(transfer.microbatch),
            kind: transfer.kind,
            timeout,
        },
        other => Error::Transport {
            rank,
            peer,
            reason: format!("{} of micro-batch {}: {other}", transfer.kind, transfer.microbatch),
        },
    }
}
