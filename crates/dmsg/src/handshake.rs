//! Connection identity hello.
//!
//! Runs once per physical connection, before any frame is exchanged, so each
//! end learns which key it is talking to. Both ends, concurrently:
//!
//! 1. write `[public_key:32][nonce:32]`
//! 2. read the peer's hello
//! 3. write `sign("dmsg-hello" || peer_nonce || own_public_key)` (64 bytes)
//! 4. read and verify the peer's signature
//!
//! The relay then writes a single verdict byte telling the client whether
//! its session was admitted.

use crate::error::{Error, Result};
use crate::keys::{PUBLIC_KEY_SIZE, PubKey, SIGNATURE_SIZE, SecretKey, Signature};
use rand_core::{OsRng, RngCore};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const NONCE_SIZE: usize = 32;
const HELLO_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE;
const CONTEXT: &[u8] = b"dmsg-hello";

/// Relay's answer after a successful hello
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Verdict {
    Admitted = 0,
    ServerFull = 1,
}

/// Client side: authenticate the relay, which must present `relay_pk`
///
/// # Errors
///
/// [`Error::HandshakeTimeout`] if the exchange exceeds `timeout`,
/// [`Error::AuthFailed`] on a key mismatch or bad signature,
/// [`Error::ServerFull`] if the relay refused the session.
pub(crate) async fn client_hello<S>(
    stream: &mut S,
    secret: &SecretKey,
    relay_pk: &PubKey,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        let remote = exchange(stream, secret).await?;
        if remote != *relay_pk {
            return Err(Error::auth("relay presented an unexpected key"));
        }
        let mut verdict = [0u8; 1];
        stream.read_exact(&mut verdict).await?;
        match verdict[0] {
            v if v == Verdict::Admitted as u8 => Ok(()),
            _ => Err(Error::ServerFull),
        }
    })
    .await
    .map_err(|_| Error::HandshakeTimeout)?
}

/// Relay side: learn and authenticate the client's key
///
/// The caller must follow up with [`send_verdict`].
pub(crate) async fn server_hello<S>(stream: &mut S, secret: &SecretKey, timeout: Duration) -> Result<PubKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, exchange(stream, secret))
        .await
        .map_err(|_| Error::HandshakeTimeout)?
}

/// Tell the client whether its session was admitted
#[cfg(test)]
pub(crate) async fn send_verdict<S>(stream: &mut S, verdict: Verdict) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[verdict as u8]).await?;
    stream.flush().await?;
    Ok(())
}

async fn exchange<S>(stream: &mut S, secret: &SecretKey) -> Result<PubKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = secret.public_key();
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let mut hello = [0u8; HELLO_SIZE];
    hello[..PUBLIC_KEY_SIZE].copy_from_slice(local.as_bytes());
    hello[PUBLIC_KEY_SIZE..].copy_from_slice(&nonce);
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut peer = [0u8; HELLO_SIZE];
    stream.read_exact(&mut peer).await?;
    let peer_pk = PubKey::from_slice(&peer[..PUBLIC_KEY_SIZE])?;
    if peer_pk.is_null() {
        return Err(Error::auth("peer presented the null key"));
    }

    let sig = secret.sign(&transcript(&peer[PUBLIC_KEY_SIZE..], &local));
    stream.write_all(sig.as_bytes()).await?;
    stream.flush().await?;

    let mut peer_sig = [0u8; SIGNATURE_SIZE];
    stream.read_exact(&mut peer_sig).await?;
    peer_pk.verify(&transcript(&nonce, &peer_pk), &Signature::from_bytes(peer_sig))?;

    Ok(peer_pk)
}

fn transcript(nonce: &[u8], signer: &PubKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CONTEXT.len() + NONCE_SIZE + PUBLIC_KEY_SIZE);
    msg.extend_from_slice(CONTEXT);
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(signer.as_bytes());
    msg
}
