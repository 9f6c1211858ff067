//! Column families for the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Credit accounts, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// User directory, keyed by `user_id`.
    pub const USERS: &str = "users";

    /// Credit history, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: history by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Webhook idempotency keys. Value is a CBOR `WebhookClaim`.
    pub const WEBHOOK_EVENTS: &str = "webhook_events";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::USERS,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::WEBHOOK_EVENTS,
    ]
}
