//! Client ↔ daemon key exchanges.
//!
//! Two layers:
//! - **Two-party** ([`two_party_client`] / [`two_party_daemon`]): run once per
//!   accepted connection, right after the TCP handshake. Both ends derive the
//!   connection's 32-byte *control key* from an X25519 exchange. The very
//!   first bytes on the wire are the client's raw public point.
//! - **N-party** (the *rekey*): run by the daemon on every join and leave.
//!   Contribution points circulate through every peer in slot order, wrapped
//!   in records sealed with each peer's control key. Every peer mixes its own
//!   per-rekey scalar into each point it receives; the final mix stays on the
//!   peer, so all peers converge on one session key the daemon never sees.
//!
//! The daemon side of the rekey is driven by the relay loop; this module owns
//! the envelope format and the client-side round handler.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::{self, CryptoError, SecretKey, KEY_LEN};
use crate::wire::{self, WireError};

/// Key-exchange failures.
#[derive(Debug, Error)]
pub enum KexError {
    /// Codec or transport failure underneath the exchange.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Bad curve input from the peer.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// A control record authenticated but did not parse.
    #[error("malformed control envelope")]
    BadEnvelope,
    /// A peer failed mid-rekey; the whole exchange restarts without it.
    #[error("rekey aborted by peer in slot {slot}")]
    RekeyAborted {
        /// Dense-table index of the peer that failed.
        slot: usize,
    },
}

/// Control-envelope plaintext, sealed under a connection's control key.
///
/// `epoch` ties every message to one rekey attempt, so rounds left over from
/// an aborted attempt cannot leak into its restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// First round of a rekey: `rounds` total rounds, starting contribution.
    Begin {
        /// Rekey attempt this round belongs to.
        epoch: u64,
        /// Total number of rounds (the current peer count).
        rounds: u64,
        /// Contribution point to mix.
        point: [u8; KEY_LEN],
    },
    /// A forwarded contribution for one of the later rounds.
    Round {
        /// Rekey attempt this round belongs to.
        epoch: u64,
        /// Rounds left including this one; `1` completes the exchange.
        remaining: u64,
        /// Contribution point to mix.
        point: [u8; KEY_LEN],
    },
    /// A peer's mixed contribution on its way back to the daemon.
    Reply {
        /// Rekey attempt the reply answers.
        epoch: u64,
        /// Mixed contribution point.
        point: [u8; KEY_LEN],
    },
}

/// Seal an envelope into a wire record under a control key.
pub fn seal_envelope(ctrl_key: &SecretKey, envelope: &Envelope) -> Result<Vec<u8>, KexError> {
    let plaintext = bincode::serialize(envelope).map_err(|_| KexError::BadEnvelope)?;
    Ok(wire::seal(ctrl_key, &plaintext)?)
}

/// Try to open a record as a control envelope.
///
/// [`WireError::AuthFailure`] means the record was not sealed under this
/// control key; for a client, that makes it a user record.
pub fn open_envelope(ctrl_key: &SecretKey, frame: &[u8]) -> Result<Envelope, KexError> {
    let plaintext = wire::open(ctrl_key, frame)?;
    bincode::deserialize(&plaintext).map_err(|_| KexError::BadEnvelope)
}

/// Client half of the two-party exchange.
///
/// Writes our ephemeral public point, reads the daemon's, and derives the
/// control key. Returns the key and our public point (the client's identity
/// material, fingerprinted for out-of-band verification).
pub async fn two_party_client<S>(stream: &mut S) -> Result<(SecretKey, [u8; KEY_LEN]), KexError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = SecretKey::random();
    let public = crypto::public_point(&secret);
    wire::send_all(stream, &public).await?;

    let mut daemon_point = [0u8; KEY_LEN];
    wire::recv_all(stream, &mut daemon_point).await?;

    let shared = crypto::mix(&secret, &daemon_point)?;
    Ok((crypto::derive_key(&shared), public))
}

/// Daemon half of the two-party exchange.
///
/// Reads the client's point first, then answers with our own; `server_key`
/// doubles as the daemon's X25519 scalar, which also rotates the derived
/// control keys whenever the daemon restarts.
pub async fn two_party_daemon<S>(stream: &mut S, server_key: &SecretKey) -> Result<SecretKey, KexError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_point = [0u8; KEY_LEN];
    wire::recv_all(stream, &mut client_point).await?;

    let public = crypto::public_point(server_key);
    wire::send_all(stream, &public).await?;

    let shared = crypto::mix(server_key, &client_point)?;
    Ok(crypto::derive_key(&shared))
}

/// Client-side state for one in-flight rekey attempt.
#[derive(Debug)]
pub struct Rekey {
    epoch: u64,
    scalar: SecretKey,
}

/// What a control envelope asks of the client.
#[derive(Debug)]
pub enum RekeyStep {
    /// Send this sealed record back to the daemon.
    Reply(Vec<u8>),
    /// The rekey finished; install this session key.
    Key(SecretKey),
    /// Stale or out-of-order round; nothing to do.
    Ignored,
}

/// Advance the client-side rekey state with one control envelope.
///
/// `Begin` always starts over with a fresh scalar; `Round` messages for any
/// other epoch are dropped, which is what makes aborted attempts harmless.
pub fn respond(
    state: &mut Option<Rekey>,
    ctrl_key: &SecretKey,
    envelope: Envelope,
) -> Result<RekeyStep, KexError> {
    match envelope {
        Envelope::Begin { epoch, rounds, point } => {
            let rekey = Rekey {
                epoch,
                scalar: SecretKey::random(),
            };
            let step = mix_round(&rekey, ctrl_key, rounds, &point)?;
            *state = match step {
                RekeyStep::Key(_) => None,
                _ => Some(rekey),
            };
            Ok(step)
        }
        Envelope::Round { epoch, remaining, point } => match state {
            Some(rekey) if rekey.epoch == epoch => {
                let step = mix_round(rekey, ctrl_key, remaining, &point)?;
                if matches!(step, RekeyStep::Key(_)) {
                    *state = None;
                }
                Ok(step)
            }
            _ => Ok(RekeyStep::Ignored),
        },
        // Replies only ever travel client → daemon.
        Envelope::Reply { .. } => Ok(RekeyStep::Ignored),
    }
}

fn mix_round(
    rekey: &Rekey,
    ctrl_key: &SecretKey,
    remaining: u64,
    point: &[u8; KEY_LEN],
) -> Result<RekeyStep, KexError> {
    let mixed = crypto::mix(&rekey.scalar, point)?;
    if remaining <= 1 {
        // Final round: the fully-mixed point never goes back on the wire.
        return Ok(RekeyStep::Key(crypto::derive_key(&mixed)));
    }
    let reply = seal_envelope(
        ctrl_key,
        &Envelope::Reply {
            epoch: rekey.epoch,
            point: mixed,
        },
    )?;
    Ok(RekeyStep::Reply(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_party_ends_agree() {
        let (mut client_end, mut daemon_end) = tokio::io::duplex(128);
        let server_key = SecretKey::random();

        let (client, daemon) = tokio::join!(
            two_party_client(&mut client_end),
            two_party_daemon(&mut daemon_end, &server_key),
        );
        let (ctrl_client, public) = client.unwrap();
        let ctrl_daemon = daemon.unwrap();

        assert_eq!(ctrl_client.as_bytes(), ctrl_daemon.as_bytes());
        assert_ne!(public, [0u8; KEY_LEN]);
    }

    #[test]
    fn envelope_roundtrip() {
        let ctrl = SecretKey::from_bytes([9u8; KEY_LEN]);
        let envelope = Envelope::Round {
            epoch: 3,
            remaining: 2,
            point: [0x5Au8; KEY_LEN],
        };
        let frame = seal_envelope(&ctrl, &envelope).unwrap();
        match open_envelope(&ctrl, &frame).unwrap() {
            Envelope::Round { epoch, remaining, point } => {
                assert_eq!((epoch, remaining), (3, 2));
                assert_eq!(point, [0x5Au8; KEY_LEN]);
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn user_record_is_not_an_envelope() {
        let ctrl = SecretKey::from_bytes([1u8; KEY_LEN]);
        let session = SecretKey::from_bytes([2u8; KEY_LEN]);
        let frame = wire::seal(&session, b"alice: hi").unwrap();
        assert!(matches!(
            open_envelope(&ctrl, &frame),
            Err(KexError::Wire(WireError::AuthFailure))
        ));
    }

    #[test]
    fn single_peer_rekey_completes_on_begin() {
        let ctrl = SecretKey::from_bytes([7u8; KEY_LEN]);
        let mut state = None;
        let step = respond(
            &mut state,
            &ctrl,
            Envelope::Begin {
                epoch: 1,
                rounds: 1,
                point: crypto::public_point(&SecretKey::random()),
            },
        )
        .unwrap();
        assert!(matches!(step, RekeyStep::Key(_)));
        assert!(state.is_none());
    }

    #[test]
    fn stale_epoch_rounds_are_ignored() {
        let ctrl = SecretKey::from_bytes([7u8; KEY_LEN]);
        let point = crypto::public_point(&SecretKey::random());

        let mut state = None;
        let step = respond(
            &mut state,
            &ctrl,
            Envelope::Begin { epoch: 5, rounds: 3, point },
        )
        .unwrap();
        assert!(matches!(step, RekeyStep::Reply(_)));

        let stale = respond(
            &mut state,
            &ctrl,
            Envelope::Round { epoch: 4, remaining: 2, point },
        )
        .unwrap();
        assert!(matches!(stale, RekeyStep::Ignored));

        let current = respond(
            &mut state,
            &ctrl,
            Envelope::Round { epoch: 5, remaining: 1, point },
        )
        .unwrap();
        assert!(matches!(current, RekeyStep::Key(_)));
    }

    /// The ring algebra: chains seeded from the server point and mixed once
    /// by every peer converge on one value no matter where they start.
    #[test]
    fn contribution_chains_converge() {
        let server_key = SecretKey::from_bytes([0x0Fu8; KEY_LEN]);
        let peers: Vec<SecretKey> = (1u8..=3).map(|b| SecretKey::from_bytes([b; KEY_LEN])).collect();
        let start = crypto::public_point(&server_key);

        let mut finals = Vec::new();
        for first in 0..peers.len() {
            let mut point = start;
            for hop in 0..peers.len() {
                let peer = &peers[(first + hop) % peers.len()];
                point = crypto::mix(peer, &point).unwrap();
            }
            finals.push(crypto::derive_key(&point));
        }
        assert!(finals
            .windows(2)
            .all(|pair| pair[0].as_bytes() == pair[1].as_bytes()));
    }
}
