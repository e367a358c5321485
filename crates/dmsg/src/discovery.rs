//! Discovery collaborator.
//!
//! Endpoints publish signed [`Entry`] records: clients list the relay
//! servers they are reachable through, relays advertise their dial address
//! and spare capacity. Dialers [`resolve`](Discovery::resolve) a key to its
//! entry before opening a circuit.
//!
//! The [`Discovery`] trait is the seam to a real discovery service;
//! [`MemoryDiscovery`] is an in-process implementation with the same
//! validation rules.

use crate::error::{DiscoveryError, Error, Result};
use crate::keys::{PubKey, SecretKey, Signature};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Entry format version
pub const ENTRY_VERSION: &str = "0.0.1";

/// Client half of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Relays the client holds connections to
    pub delegated_servers: Vec<PubKey>,
}

/// Relay half of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// `host:port` clients dial
    pub address: String,
    /// Sessions the relay can still admit
    pub available_sessions: u64,
}

/// Signed discovery record for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry format version
    pub version: String,
    /// Strictly increasing per key
    pub sequence: u64,
    /// Seconds since the Unix epoch when the entry was built
    pub timestamp: u64,
    /// Key the entry describes (and is signed by)
    pub static_pk: PubKey,
    /// Present for endpoints
    pub client: Option<ClientEntry>,
    /// Present for relays
    pub server: Option<ServerEntry>,
    /// Ed25519 signature over the entry with this field unset
    pub signature: Option<Vec<u8>>,
}

impl Entry {
    /// Unsigned client entry
    #[must_use]
    pub fn client(static_pk: PubKey, delegated_servers: Vec<PubKey>, sequence: u64) -> Self {
        Self::unsigned(static_pk, sequence, Some(ClientEntry { delegated_servers }), None)
    }

    /// Unsigned relay entry
    #[must_use]
    pub fn server(static_pk: PubKey, address: String, available_sessions: u64, sequence: u64) -> Self {
        Self::unsigned(
            static_pk,
            sequence,
            None,
            Some(ServerEntry {
                address,
                available_sessions,
            }),
        )
    }

    fn unsigned(
        static_pk: PubKey,
        sequence: u64,
        client: Option<ClientEntry>,
        server: Option<ServerEntry>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp,
            static_pk,
            client,
            server,
            signature: None,
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        bincode::serialize(&unsigned)
            .map_err(|e| Error::Discovery(DiscoveryError::Encoding(e.to_string())))
    }

    /// Sign with the key the entry describes
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if `secret` does not match `static_pk`.
    pub fn sign(&mut self, secret: &SecretKey) -> Result<()> {
        if secret.public_key() != self.static_pk {
            return Err(Error::InvalidKey);
        }
        let sig = secret.sign(&self.signing_bytes()?);
        self.signature = Some(sig.as_bytes().to_vec());
        Ok(())
    }

    /// Check the signature against `static_pk`
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidSignature`] if absent or wrong.
    pub fn verify(&self) -> Result<()> {
        let sig = self
            .signature
            .as_deref()
            .ok_or(DiscoveryError::InvalidSignature)?;
        let sig = Signature::from_slice(sig).map_err(|_| DiscoveryError::InvalidSignature)?;
        self.static_pk
            .verify(&self.signing_bytes()?, &sig)
            .map_err(|_| DiscoveryError::InvalidSignature.into())
    }

    /// Relays listed by a client entry (empty for relay entries)
    #[must_use]
    pub fn delegated_servers(&self) -> &[PubKey] {
        self.client
            .as_ref()
            .map(|c| c.delegated_servers.as_slice())
            .unwrap_or_default()
    }
}

/// Discovery service as seen by clients and relays
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Look up the entry published for `pk`
    async fn resolve(&self, pk: &PubKey) -> Result<Entry>;

    /// Publish a signed entry, replacing any older one for the same key
    async fn publish(&self, entry: Entry) -> Result<()>;

    /// Relays currently advertising spare sessions
    async fn available_servers(&self) -> Result<Vec<Entry>>;
}

/// In-process discovery backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    entries: DashMap<PubKey, Entry>,
}

impl MemoryDiscovery {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of published entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been published
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn resolve(&self, pk: &PubKey) -> Result<Entry> {
        self.entries
            .get(pk)
            .map(|e| e.value().clone())
            .ok_or_else(|| DiscoveryError::EntryNotFound(pk.short()).into())
    }

    async fn publish(&self, entry: Entry) -> Result<()> {
        entry.verify()?;
        match self.entries.entry(entry.static_pk) {
            dashmap::mapref::entry::Entry::Occupied(mut current) => {
                if entry.sequence <= current.get().sequence {
                    return Err(DiscoveryError::SequenceOutOfOrder {
                        current: current.get().sequence,
                        received: entry.sequence,
                    }
                    .into());
                }
                current.insert(entry);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>> {
        let mut servers: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| e.server.as_ref().is_some_and(|s| s.available_sessions > 0))
            .map(|e| e.value().clone())
            .collect();
        servers.sort_by_key(|e| std::cmp::Reverse(e.server.as_ref().map_or(0, |s| s.available_sessions)));
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_client(sk: &SecretKey, servers: Vec<PubKey>, seq: u64) -> Entry {
        let mut entry = Entry::client(sk.public_key(), servers, seq);
        entry.sign(sk).unwrap();
        entry
    }

    #[test]
    fn test_sign_verify() {
        let sk = SecretKey::generate();
        let entry = signed_client(&sk, vec![PubKey::from_bytes([1; 32])], 0);
        assert!(entry.verify().is_ok());

        let mut tampered = entry.clone();
        tampered.sequence = 9;
        assert!(tampered.verify().is_err());

        let mut unsigned = entry;
        unsigned.signature = None;
        assert!(unsigned.verify().is_err());
    }

    #[test]
    fn test_sign_with_wrong_key() {
        let sk = SecretKey::generate();
        let mut entry = Entry::client(sk.public_key(), Vec::new(), 0);
        assert!(matches!(
            entry.sign(&SecretKey::generate()),
            Err(Error::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn test_publish_resolve() {
        let disc = MemoryDiscovery::new();
        let sk = SecretKey::generate();
        let relay = PubKey::from_bytes([7; 32]);

        disc.publish(signed_client(&sk, vec![relay], 1)).await.unwrap();
        let entry = disc.resolve(&sk.public_key()).await.unwrap();
        assert_eq!(entry.delegated_servers(), &[relay]);

        let missing = disc.resolve(&relay).await;
        assert!(matches!(
            missing,
            Err(Error::Discovery(DiscoveryError::EntryNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_sequence_must_increase() {
        let disc = MemoryDiscovery::new();
        let sk = SecretKey::generate();

        disc.publish(signed_client(&sk, Vec::new(), 5)).await.unwrap();
        let stale = disc.publish(signed_client(&sk, Vec::new(), 5)).await;
        assert!(matches!(
            stale,
            Err(Error::Discovery(DiscoveryError::SequenceOutOfOrder {
                current: 5,
                received: 5
            }))
        ));
        disc.publish(signed_client(&sk, Vec::new(), 6)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsigned_rejected() {
        let disc = MemoryDiscovery::new();
        let entry = Entry::client(SecretKey::generate().public_key(), Vec::new(), 0);
        assert!(disc.publish(entry).await.is_err());
        assert!(disc.is_empty());
    }

    #[tokio::test]
    async fn test_available_servers() {
        let disc = MemoryDiscovery::new();
        let busy = SecretKey::generate();
        let idle = SecretKey::generate();
        let full = SecretKey::generate();

        for (sk, sessions) in [(&busy, 3), (&idle, 100), (&full, 0)] {
            let mut entry = Entry::server(sk.public_key(), "127.0.0.1:1".into(), sessions, 0);
            entry.sign(sk).unwrap();
            disc.publish(entry).await.unwrap();
        }

        let servers = disc.available_servers().await.unwrap();
        let keys: Vec<_> = servers.iter().map(|e| e.static_pk).collect();
        assert_eq!(keys, vec![idle.public_key(), busy.public_key()]);
    }
}
