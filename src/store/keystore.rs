//! Encrypted key store
//!
//! Wallet records pair an agent id with an address and the agent's private
//! key, encrypted at rest with XChaCha20-Poly1305 under the deployment
//! secret. The cipher is authenticated: any tampering with stored
//! ciphertext surfaces as `decrypt_failed`, never as substituted plaintext.
//!
//! Plaintext key bytes only ever exist inside [`Zeroizing`] buffers that
//! wipe on drop.

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use alloy::hex;
use alloy::primitives::Address;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use zeroize::Zeroizing;

use super::Db;
use crate::{Error, Result};

const NONCE_LEN: usize = 24;
const META_KEY_CHECK: &str = "key_check";
const KEY_CHECK_MARKER: &[u8] = b"agentvault:key-check:v1";

/// One wallet record, as persisted.
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub agent_id: String,
    pub address: Address,
    pub ciphertext: Vec<u8>,
    pub chain_id: u64,
    /// Nonce of the most recent accepted broadcast; `None` before the first.
    pub last_nonce: Option<u64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parse a 32-byte hex deployment secret.
pub fn parse_secret_hex(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
        .map_err(|_| Error::Config("encryption secret must be hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| Error::Config("encryption secret must be 32 bytes".into()))
}

/// Load the sidecar secret, generating one (0600 on unix) on first start.
pub fn load_or_create_secret(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read secret file: {e}")))?;
        return parse_secret_hex(&raw);
    }

    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    std::fs::write(path, hex::encode(secret))
        .map_err(|e| Error::Config(format!("write secret file: {e}")))?;
    #[cfg(unix)]
    {
        let mut perms = std::fs::metadata(path)
            .map_err(|e| Error::Config(format!("stat secret file: {e}")))?
            .permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)
            .map_err(|e| Error::Config(format!("chmod secret file: {e}")))?;
    }
    tracing::info!(path = %path.display(), "generated new encryption secret");
    Ok(secret)
}

/// Store of encrypted wallet records. Sole owner of the `wallets` table.
pub struct KeyStore {
    db: Db,
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Open the store under the given secret.
    ///
    /// A key-check ciphertext is written on first start; a later open with a
    /// secret that cannot decrypt it refuses to proceed, so a mismatched
    /// sidecar or env secret is caught before any record is touched.
    pub fn open(db: Db, secret: &[u8; 32]) -> Result<Self> {
        let cipher = XChaCha20Poly1305::new(secret.into());
        let store = Self { db, cipher };

        let existing: Option<Vec<u8>> = store.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![META_KEY_CHECK],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match existing {
            Some(blob) => {
                store.open_blob(&blob).map_err(|_| {
                    Error::Config(
                        "encryption secret does not match existing records".into(),
                    )
                })?;
            }
            None => {
                let blob = store.seal(KEY_CHECK_MARKER)?;
                store.db.with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                        params![META_KEY_CHECK, blob],
                    )?;
                    Ok(())
                })?;
            }
        }
        Ok(store)
    }

    /// Encrypt under the deployment secret; output is `nonce || ciphertext`.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Storage("encryption failed".into()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open_blob(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if blob.len() <= NONCE_LEN {
            return Err(Error::DecryptFailed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| Error::DecryptFailed)
    }

    /// Persist a new wallet record atomically.
    ///
    /// Rejects an `agent_id` that already exists and an `address` already
    /// bound to a different agent; both are also backstopped by the table's
    /// uniqueness constraints.
    pub fn put(
        &self,
        agent_id: &str,
        address: Address,
        key_bytes: &[u8],
        chain_id: u64,
        metadata: serde_json::Value,
    ) -> Result<WalletRecord> {
        let ciphertext = self.seal(key_bytes)?;
        let now = Utc::now();
        let addr_str = format!("{address:#x}");

        self.db.with_tx(|tx| {
            let agent_taken: Option<String> = tx
                .query_row(
                    "SELECT agent_id FROM wallets WHERE agent_id = ?1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .optional()?;
            if agent_taken.is_some() {
                return Err(Error::AgentExists(agent_id.to_string()));
            }

            let addr_taken: Option<String> = tx
                .query_row(
                    "SELECT agent_id FROM wallets WHERE address = ?1",
                    params![addr_str],
                    |row| row.get(0),
                )
                .optional()?;
            if addr_taken.is_some() {
                return Err(Error::AddressReuse);
            }

            tx.execute(
                "INSERT INTO wallets
                 (agent_id, address, ciphertext, chain_id, last_nonce, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?6)",
                params![
                    agent_id,
                    addr_str,
                    ciphertext,
                    chain_id as i64,
                    metadata.to_string(),
                    now.timestamp_millis(),
                ],
            )?;
            Ok(())
        })?;

        Ok(WalletRecord {
            agent_id: agent_id.to_string(),
            address,
            ciphertext,
            chain_id,
            last_nonce: None,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get(&self, agent_id: &str) -> Result<WalletRecord> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT agent_id, address, ciphertext, chain_id, last_nonce, metadata,
                        created_at, updated_at
                 FROM wallets WHERE agent_id = ?1",
                params![agent_id],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(agent_id.to_string()))
        })
    }

    /// Decrypt the stored key for `agent_id`.
    pub fn decrypt(&self, agent_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        let record = self.get(agent_id)?;
        self.open_blob(&record.ciphertext)
    }

    /// Advance `last_nonce` to `max(last_nonce, used_nonce)`.
    ///
    /// Called inside the transfer critical section, after an accepted
    /// broadcast and before the per-address token is released.
    pub fn advance_nonce(&self, agent_id: &str, used_nonce: u64) -> Result<()> {
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE wallets
                 SET last_nonce = MAX(COALESCE(last_nonce, -1), ?2), updated_at = ?3
                 WHERE agent_id = ?1",
                params![agent_id, used_nonce as i64, Utc::now().timestamp_millis()],
            )?)
        })?;
        if updated == 0 {
            return Err(Error::NotFound(agent_id.to_string()));
        }
        Ok(())
    }

    /// All `(agent_id, address)` pairs, ordered by agent id.
    pub fn list(&self) -> Result<Vec<(String, Address)>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT agent_id, address FROM wallets ORDER BY agent_id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (agent_id, addr) = row?;
                let address = addr
                    .parse()
                    .map_err(|_| Error::Storage(format!("corrupt address for '{agent_id}'")))?;
                out.push((agent_id, address));
            }
            Ok(out)
        })
    }

    /// Test hook: corrupt a stored ciphertext in place.
    #[cfg(test)]
    pub fn tamper(&self, agent_id: &str, byte_index: usize) -> Result<()> {
        let record = self.get(agent_id)?;
        let mut blob = record.ciphertext;
        let idx = byte_index % blob.len();
        blob[idx] ^= 0x01;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE wallets SET ciphertext = ?2 WHERE agent_id = ?1",
                params![agent_id, blob],
            )?;
            Ok(())
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletRecord> {
    let agent_id: String = row.get(0)?;
    let address: String = row.get(1)?;
    let metadata: String = row.get(5)?;
    Ok(WalletRecord {
        address: address.parse().unwrap_or(Address::ZERO),
        ciphertext: row.get(2)?,
        chain_id: row.get::<_, i64>(3)? as u64,
        last_nonce: row.get::<_, Option<i64>>(4)?.map(|n| n as u64),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: ms_to_datetime(row.get(6)?),
        updated_at: ms_to_datetime(row.get(7)?),
        agent_id,
    })
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn test_store() -> KeyStore {
        let db = Db::open_in_memory().unwrap();
        KeyStore::open(db, &[7u8; 32]).unwrap()
    }

    const ADDR_A: Address = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
    const ADDR_B: Address = address!("70997970c51812dc3a010c7d01b50e0d17dc79c8");

    #[test]
    fn put_get_decrypt_round_trip() {
        let store = test_store();
        let key = [0x42u8; 32];
        store
            .put("a1", ADDR_A, &key, 11155111, serde_json::json!({}))
            .unwrap();

        let record = store.get("a1").unwrap();
        assert_eq!(record.address, ADDR_A);
        assert_eq!(record.chain_id, 11155111);
        assert_eq!(record.last_nonce, None);

        let plaintext = store.decrypt("a1").unwrap();
        assert_eq!(&plaintext[..], &key);
    }

    #[test]
    fn duplicate_agent_and_address_are_rejected() {
        let store = test_store();
        store
            .put("a1", ADDR_A, &[1u8; 32], 1, serde_json::json!({}))
            .unwrap();

        let err = store
            .put("a1", ADDR_B, &[2u8; 32], 1, serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "agent_exists");

        let err = store
            .put("a2", ADDR_A, &[2u8; 32], 1, serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "address_reuse");
    }

    #[test]
    fn missing_agent_is_not_found() {
        let store = test_store();
        assert_eq!(store.get("ghost").unwrap_err().kind(), "not_found");
        assert_eq!(store.decrypt("ghost").unwrap_err().kind(), "not_found");
        assert_eq!(store.advance_nonce("ghost", 1).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn tampering_any_byte_fails_decryption() {
        let store = test_store();
        store
            .put("a1", ADDR_A, &[9u8; 32], 1, serde_json::json!({}))
            .unwrap();
        let blob_len = store.get("a1").unwrap().ciphertext.len();

        for index in [0, NONCE_LEN, blob_len / 2, blob_len - 1] {
            let fresh = test_store();
            fresh
                .put("a1", ADDR_A, &[9u8; 32], 1, serde_json::json!({}))
                .unwrap();
            fresh.tamper("a1", index).unwrap();
            assert_eq!(fresh.decrypt("a1").unwrap_err().kind(), "decrypt_failed");
        }
    }

    #[test]
    fn advance_nonce_is_monotone() {
        let store = test_store();
        store
            .put("a1", ADDR_A, &[1u8; 32], 1, serde_json::json!({}))
            .unwrap();

        store.advance_nonce("a1", 5).unwrap();
        assert_eq!(store.get("a1").unwrap().last_nonce, Some(5));

        // A lower value never regresses the stored nonce
        store.advance_nonce("a1", 3).unwrap();
        assert_eq!(store.get("a1").unwrap().last_nonce, Some(5));

        store.advance_nonce("a1", 6).unwrap();
        assert_eq!(store.get("a1").unwrap().last_nonce, Some(6));
    }

    #[test]
    fn mismatched_secret_refuses_to_open() {
        let db = Db::open_in_memory().unwrap();
        KeyStore::open(db.clone(), &[7u8; 32]).unwrap();

        let err = KeyStore::open(db.clone(), &[8u8; 32]).unwrap_err();
        assert_eq!(err.kind(), "config");

        // The original secret still opens
        KeyStore::open(db, &[7u8; 32]).unwrap();
    }

    #[test]
    fn sidecar_secret_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.key");
        let first = load_or_create_secret(&path).unwrap();
        let second = load_or_create_secret(&path).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn secret_hex_parsing() {
        assert!(parse_secret_hex(&"ab".repeat(32)).is_ok());
        assert!(parse_secret_hex(&format!("0x{}", "ab".repeat(32))).is_ok());
        assert!(parse_secret_hex("abcd").is_err());
        assert!(parse_secret_hex("zz").is_err());
    }

    #[test]
    fn list_returns_all_records_in_order() {
        let store = test_store();
        store
            .put("b", ADDR_B, &[1u8; 32], 1, serde_json::json!({}))
            .unwrap();
        store
            .put("a", ADDR_A, &[2u8; 32], 1, serde_json::json!({}))
            .unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "a");
        assert_eq!(listed[1].0, "b");
    }
}
