//! Key encoding for the `RocksDB` column families.

use atelier_core::{TransactionId, UserId};

/// Account (and user directory) key: the 16 UUID bytes.
#[must_use]
pub fn user_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Transaction key: the 16 ULID bytes.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// User-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
///
/// ULIDs are time-ordered, so a user's entries sort by creation time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Prefix for iterating all history entries of a user.
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the transaction ID from a user-transaction index key.
///
/// Returns `None` for keys shorter than 32 bytes.
#[must_use]
pub fn transaction_id_from_user_key(key: &[u8]) -> Option<TransactionId> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

/// Webhook idempotency key.
#[must_use]
pub fn webhook_event_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}
