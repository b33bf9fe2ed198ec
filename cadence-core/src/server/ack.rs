//! Flow teardown acknowledgement
//!
//! The ack echoes the FIN's datagram header followed by the server header
//! and is padded to the flow's buffer length. A sender that did not get the
//! ack retransmits its FIN, so after each ack the server waits for another
//! FIN and answers it again, for a bounded number of rounds. Data datagrams
//! still queued on the socket when the flow ended are read and dropped.

use crate::config::AckSettings;
use crate::Result;
use cadence_common::wire::{self, DATAGRAM_HEADER_LEN};
use cadence_common::{PacketId, SequenceWidth, ServerHeader};
use cadence_transport::FlowSocket;
use std::time::Instant;

/// How the ack exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The sender went quiet after `rounds` acks
    Delivered { rounds: u32 },
    /// The sender was still retransmitting after the last round
    GaveUp { rounds: u32 },
}

/// Build the ack datagram for a FIN whose header is `fin`
pub fn build_ack(
    fin: &[u8],
    header: &ServerHeader,
    width: SequenceWidth,
    buffer_len: usize,
) -> Result<Vec<u8>> {
    let fin = fin.get(..DATAGRAM_HEADER_LEN).ok_or(wire::WireError::Truncated {
        needed: DATAGRAM_HEADER_LEN,
        available: fin.len(),
    })?;
    let needed = DATAGRAM_HEADER_LEN + ServerHeader::encoded_len(width, header.extend.is_some());
    let mut ack = vec![0u8; buffer_len.max(needed)];
    ack[..DATAGRAM_HEADER_LEN].copy_from_slice(fin);
    header.encode(&mut ack[DATAGRAM_HEADER_LEN..], width)?;
    Ok(ack)
}

/// Send `ack` until the sender stops retransmitting its FIN
///
/// Each round sends the ack and waits up to `settings.wait` for another FIN.
/// Silence or a failed read ends the exchange.
pub fn send_ack<S: FlowSocket + ?Sized>(
    socket: &mut S,
    ack: &[u8],
    width: SequenceWidth,
    settings: &AckSettings,
) -> Result<AckOutcome> {
    let mut scratch = vec![0u8; ack.len().max(DATAGRAM_HEADER_LEN)];
    for round in 1..=settings.rounds {
        socket.send(ack)?;
        if !wait_for_fin(socket, &mut scratch, width, settings)? {
            tracing::debug!("Ack delivered after {} round(s)", round);
            return Ok(AckOutcome::Delivered { rounds: round });
        }
        tracing::trace!("FIN retransmitted, resending ack (round {})", round);
    }
    tracing::warn!("Ack not acknowledged after {} rounds, giving up", settings.rounds);
    Ok(AckOutcome::GaveUp { rounds: settings.rounds })
}

/// Whether a FIN arrives within one wait window
fn wait_for_fin<S: FlowSocket + ?Sized>(
    socket: &mut S,
    scratch: &mut [u8],
    width: SequenceWidth,
    settings: &AckSettings,
) -> Result<bool> {
    let deadline = Instant::now() + settings.wait;
    let mut stale = 0u64;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || !socket.wait_readable(remaining)? {
            break;
        }
        let n = match socket.recv_datagram(scratch) {
            Ok(n) if n > 0 => n,
            Ok(_) | Err(_) => break,
        };
        match PacketId::decode(&scratch[..n], width) {
            Ok(id) if id.terminal => return Ok(true),
            _ => stale += 1,
        }
    }
    if stale > 0 {
        tracing::debug!("Dropped {} non-FIN datagram(s) while waiting on the ack", stale);
    }
    Ok(false)
}
