//! The on-wire record format and its streaming primitives.
//!
//! One record is one authenticated, length-prefixed unit:
//!
//! ```text
//! IV[16] ‖ TAG[16] ‖ LEN[8, big-endian] ‖ CT[LEN]      LEN ≤ DATA_LEN_MAX
//! ```
//!
//! Framing is fixed-offset: read the 40-byte header, then exactly `LEN` more
//! bytes. [`send_all`] and [`recv_all`] loop over the transport until the
//! requested byte count has moved, so a record either transfers whole or
//! fails. The daemon relays records without decrypting them; only endpoints
//! holding the right key can [`open`] one.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::SecretKey;

/// AES-256-GCM with the record's 16-byte IV and 16-byte tag.
type RecordCipher = AesGcm<Aes256, U16>;

/// Record initialization vector length.
pub const IV_LEN: usize = 16;
/// Authentication tag length.
pub const TAG_LEN: usize = 16;
/// Length-field width.
pub const LEN_LEN: usize = 8;
/// Fixed header: IV ‖ TAG ‖ LEN.
pub const HEADER_LEN: usize = IV_LEN + TAG_LEN + LEN_LEN;
/// Hard cap on a record's payload.
pub const DATA_LEN_MAX: usize = 16 * 1024;

/// Codec and transport failures.
#[derive(Debug, Error)]
pub enum WireError {
    /// Socket-level failure.
    #[error("socket error: {0}")]
    Transport(#[from] std::io::Error),
    /// The peer closed the connection on a record boundary.
    #[error("connection closed by peer")]
    Closed,
    /// The peer closed the connection mid-record.
    #[error("peer closed mid-record")]
    ShortRead,
    /// The header announced a payload beyond [`DATA_LEN_MAX`].
    #[error("frame length {len} exceeds the {DATA_LEN_MAX}-byte cap")]
    OversizeFrame {
        /// Length announced by the offending header.
        len: u64,
    },
    /// Authentication tag mismatch.
    #[error("record failed authentication")]
    AuthFailure,
}

/// Fill `buf` completely, looping over short reads.
///
/// A peer close before the first byte is [`WireError::Closed`]; a close after
/// it is [`WireError::ShortRead`].
pub async fn recv_all<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                WireError::Closed
            } else {
                WireError::ShortRead
            });
        }
        filled += n;
    }
    Ok(())
}

/// Write all of `buf`, looping over short writes.
pub async fn send_all<W>(writer: &mut W, buf: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(buf).await?;
    Ok(())
}

/// Parse and validate the length field of a 40-byte record header.
pub fn frame_len(header: &[u8; HEADER_LEN]) -> Result<usize, WireError> {
    let mut len_bytes = [0u8; LEN_LEN];
    len_bytes.copy_from_slice(&header[IV_LEN + TAG_LEN..]);
    let len = u64::from_be_bytes(len_bytes);
    if len > DATA_LEN_MAX as u64 {
        return Err(WireError::OversizeFrame { len });
    }
    Ok(len as usize)
}

/// Receive one whole record, header included, without decrypting it.
pub async fn recv_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    recv_all(reader, &mut header).await?;
    let len = frame_len(&header)?;

    let mut frame = vec![0u8; HEADER_LEN + len];
    frame[..HEADER_LEN].copy_from_slice(&header);
    match recv_all(reader, &mut frame[HEADER_LEN..]).await {
        Ok(()) => Ok(frame),
        // A close between header and body is always mid-record.
        Err(WireError::Closed) => Err(WireError::ShortRead),
        Err(e) => Err(e),
    }
}

/// Seal `plaintext` into a complete record under `key` with a fresh IV.
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
    if plaintext.len() > DATA_LEN_MAX {
        return Err(WireError::OversizeFrame {
            len: plaintext.len() as u64,
        });
    }

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut frame = Vec::with_capacity(HEADER_LEN + plaintext.len());
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&[0u8; TAG_LEN]);
    frame.extend_from_slice(&(plaintext.len() as u64).to_be_bytes());
    frame.extend_from_slice(plaintext);

    let cipher = RecordCipher::new(GenericArray::from_slice(key.as_bytes()));
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut frame[HEADER_LEN..])
        .map_err(|_| WireError::AuthFailure)?;
    frame[IV_LEN..IV_LEN + TAG_LEN].copy_from_slice(&tag);
    Ok(frame)
}

/// Authenticate and decrypt a whole record under `key`.
pub fn open(key: &SecretKey, frame: &[u8]) -> Result<Vec<u8>, WireError> {
    if frame.len() < HEADER_LEN {
        return Err(WireError::ShortRead);
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&frame[..HEADER_LEN]);
    let len = frame_len(&header)?;
    if frame.len() != HEADER_LEN + len {
        return Err(WireError::ShortRead);
    }

    let mut plaintext = frame[HEADER_LEN..].to_vec();
    let cipher = RecordCipher::new(GenericArray::from_slice(key.as_bytes()));
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&frame[..IV_LEN]),
            b"",
            &mut plaintext,
            GenericArray::from_slice(&frame[IV_LEN..IV_LEN + TAG_LEN]),
        )
        .map_err(|_| WireError::AuthFailure)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_bytes([byte; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let k = key(0x42);
        for len in [0usize, 1, 31, 1024, DATA_LEN_MAX] {
            let plaintext = vec![0xA5u8; len];
            let frame = seal(&k, &plaintext).unwrap();
            assert_eq!(frame.len(), HEADER_LEN + len);
            assert_eq!(open(&k, &frame).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let frame = seal(&key(0x01), b"attack at dawn").unwrap();
        assert!(matches!(
            open(&key(0x02), &frame),
            Err(WireError::AuthFailure)
        ));
    }

    #[test]
    fn tampering_fails_authentication() {
        let k = key(0x07);
        let mut frame = seal(&k, b"untouched").unwrap();
        for index in [0, IV_LEN, HEADER_LEN] {
            frame[index] ^= 0x80;
            assert!(matches!(open(&k, &frame), Err(WireError::AuthFailure)));
            frame[index] ^= 0x80;
        }
        // Undoing the flips restores the record.
        assert_eq!(open(&k, &frame).unwrap(), b"untouched");
    }

    #[test]
    fn oversize_payload_is_refused() {
        let plaintext = vec![0u8; DATA_LEN_MAX + 1];
        assert!(matches!(
            seal(&key(0x00), &plaintext),
            Err(WireError::OversizeFrame { .. })
        ));
    }

    #[test]
    fn oversize_header_is_refused() {
        let mut header = [0u8; HEADER_LEN];
        header[IV_LEN + TAG_LEN..].copy_from_slice(&0xFFFF_FFFFu64.to_be_bytes());
        assert!(matches!(
            frame_len(&header),
            Err(WireError::OversizeFrame { len: 0xFFFF_FFFF })
        ));
    }

    #[tokio::test]
    async fn recv_frame_moves_exact_bytes() {
        let k = key(0x33);
        let frame = seal(&k, b"first").unwrap();
        let trailer = seal(&k, b"second").unwrap();

        let (mut tx, mut rx) = tokio::io::duplex(64);
        // Interleave partial writes to exercise the recv loop.
        let mut bytes = frame.clone();
        bytes.extend_from_slice(&trailer);
        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                send_all(&mut tx, chunk).await.unwrap();
            }
            tx
        });

        let got = recv_frame(&mut rx).await.unwrap();
        assert_eq!(got, frame);
        let got = recv_frame(&mut rx).await.unwrap();
        assert_eq!(open(&k, &got).unwrap(), b"second");
        drop(writer.await.unwrap());

        // Clean close on a record boundary.
        assert!(matches!(recv_frame(&mut rx).await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn close_mid_record_is_a_short_read() {
        let k = key(0x44);
        let frame = seal(&k, b"cut off").unwrap();

        let (mut tx, mut rx) = tokio::io::duplex(64);
        send_all(&mut tx, &frame[..frame.len() - 3]).await.unwrap();
        drop(tx);

        assert!(matches!(
            recv_frame(&mut rx).await,
            Err(WireError::ShortRead)
        ));
    }
}
