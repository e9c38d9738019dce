// 🗄️ Shared container - SQLite in WAL mode
//
// One database file is the container shared by the app and its widget
// extensions. It holds:
// - kv_store: small key/value pairs (the purchased-items array lives here)
// - payments: one row per purchase attempt outcome
// - events:   audit trail (restores, revocations, external grants)
// - sandbox_transactions / sandbox_deferred: the sandbox store's ledger

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use crate::cache::KeyValueStore;
use crate::purchase::PaymentStatus;
use crate::store::StoreTransaction;

// ============================================================================
// PAYMENT RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,

    /// Store transaction that settled this attempt, once there is one
    #[serde(default)]
    pub transaction_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn new(
        user_id: &str,
        product_id: &str,
        amount: Decimal,
        currency: &str,
        status: PaymentStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            product_id: product_id.to_string(),
            amount,
            currency: currency.to_string(),
            status,
            transaction_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_transaction(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }
}

// ============================================================================
// EVENT (audit trail)
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL lets widget processes read while the app writes
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payment_id TEXT UNIQUE NOT NULL,
            user_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL,
            transaction_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sandbox_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT UNIQUE NOT NULL,
            original_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            purchase_date TEXT NOT NULL,
            revocation_date TEXT,
            signature TEXT NOT NULL,
            finished INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sandbox_deferred (
            product_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_product ON payments(product_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// KEY / VALUE
// ============================================================================

pub fn kv_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value)
}

pub fn kv_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

pub fn kv_delete(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
    Ok(())
}

// ============================================================================
// PAYMENTS
// ============================================================================

pub fn insert_payment(conn: &Connection, payment: &PaymentRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO payments (
            payment_id, user_id, product_id, amount, currency, status, transaction_id,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            payment.id,
            payment.user_id,
            payment.product_id,
            payment.amount.to_string(),
            payment.currency,
            payment.status.as_str(),
            payment.transaction_id,
            payment.created_at.to_rfc3339(),
            payment.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

/// Move an existing payment to `status`, attaching `transaction_id` when given.
/// Returns false if no row has `payment_id`.
pub fn update_payment_status(
    conn: &Connection,
    payment_id: &str,
    status: PaymentStatus,
    transaction_id: Option<&str>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE payments
         SET status = ?1, transaction_id = COALESCE(?2, transaction_id), updated_at = ?3
         WHERE payment_id = ?4",
        params![status.as_str(), transaction_id, Utc::now().to_rfc3339(), payment_id],
    )?;

    Ok(updated > 0)
}

/// Payments for a product, newest first
pub fn get_payments_for_product(conn: &Connection, product_id: &str) -> Result<Vec<PaymentRecord>> {
    query_payments(conn, "WHERE product_id = ?1", &[&product_id as &dyn ToSql])
}

pub fn get_payment_for_transaction(
    conn: &Connection,
    transaction_id: &str,
) -> Result<Option<PaymentRecord>> {
    Ok(query_payments(conn, "WHERE transaction_id = ?1", &[&transaction_id as &dyn ToSql])?
        .into_iter()
        .next())
}

fn query_payments(
    conn: &Connection,
    filter: &str,
    values: &[&dyn ToSql],
) -> Result<Vec<PaymentRecord>> {
    let sql = format!(
        "SELECT payment_id, user_id, product_id, amount, currency, status, transaction_id,
                created_at, updated_at
         FROM payments
         {}
         ORDER BY id DESC",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(values, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, user_id, product_id, amount, currency, status, transaction_id, created_at, updated_at)|
             -> Result<PaymentRecord> {
                Ok(PaymentRecord {
                    id,
                    user_id,
                    product_id,
                    amount: Decimal::from_str(&amount)
                        .with_context(|| format!("Invalid stored amount: {}", amount))?,
                    currency,
                    status: PaymentStatus::from_str(&status)?,
                    transaction_id,
                    created_at: parse_timestamp(&created_at)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            },
        )
        .collect()
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(event_id, timestamp, event_type, entity_type, entity_id, data, actor)|
             -> Result<Event> {
                Ok(Event {
                    event_id,
                    timestamp: parse_timestamp(&timestamp)?,
                    event_type,
                    entity_type,
                    entity_id,
                    data: serde_json::from_str(&data).context("Invalid event data JSON")?,
                    actor,
                })
            },
        )
        .collect()
}

// ============================================================================
// SANDBOX LEDGER
// ============================================================================

/// Insert a transaction, or update its revocation and signature if present
pub fn upsert_store_transaction(conn: &Connection, tx: &StoreTransaction) -> Result<()> {
    conn.execute(
        "INSERT INTO sandbox_transactions (
            transaction_id, original_id, product_id, purchase_date, revocation_date, signature
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(transaction_id) DO UPDATE SET
            revocation_date = excluded.revocation_date,
            signature = excluded.signature",
        params![
            tx.id,
            tx.original_id,
            tx.product_id,
            tx.purchase_date.to_rfc3339(),
            tx.revocation_date.map(|d| d.to_rfc3339()),
            tx.signature,
        ],
    )?;

    Ok(())
}

pub fn mark_store_transaction_finished(conn: &Connection, transaction_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE sandbox_transactions SET finished = 1 WHERE transaction_id = ?1",
        params![transaction_id],
    )?;
    Ok(())
}

/// Ledger in insertion order, each with its finished flag
pub fn get_store_transactions(conn: &Connection) -> Result<Vec<(StoreTransaction, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT transaction_id, original_id, product_id, purchase_date, revocation_date,
                signature, finished
         FROM sandbox_transactions
         ORDER BY id ASC",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, original_id, product_id, purchase_date, revocation_date, signature, finished)|
             -> Result<(StoreTransaction, bool)> {
                let revocation_date = match revocation_date {
                    Some(value) => Some(parse_timestamp(&value)?),
                    None => None,
                };
                let tx = StoreTransaction {
                    id,
                    original_id,
                    product_id,
                    purchase_date: parse_timestamp(&purchase_date)?,
                    revocation_date,
                    signature,
                };
                Ok((tx, finished))
            },
        )
        .collect()
}

pub fn insert_deferred_product(conn: &Connection, product_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sandbox_deferred (product_id, created_at) VALUES (?1, ?2)",
        params![product_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn delete_deferred_product(conn: &Connection, product_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM sandbox_deferred WHERE product_id = ?1",
        params![product_id],
    )?;
    Ok(())
}

pub fn get_deferred_products(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT product_id FROM sandbox_deferred ORDER BY created_at")?;
    let products = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(products)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp: {}", value))?
        .with_timezone(&Utc))
}

// ============================================================================
// DATABASE HANDLE
// ============================================================================

/// Owned connection to the shared container.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;
        setup_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    pub fn record_payment(&self, payment: &PaymentRecord) -> Result<()> {
        let conn = self.lock()?;
        insert_payment(&conn, payment)
    }

    pub fn update_payment_status(
        &self,
        payment_id: &str,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        update_payment_status(&conn, payment_id, status, transaction_id)
    }

    pub fn payments_for_product(&self, product_id: &str) -> Result<Vec<PaymentRecord>> {
        let conn = self.lock()?;
        get_payments_for_product(&conn, product_id)
    }

    pub fn payment_for_transaction(&self, transaction_id: &str) -> Result<Option<PaymentRecord>> {
        let conn = self.lock()?;
        get_payment_for_transaction(&conn, transaction_id)
    }

    /// Newest attempt for `product_id` still waiting on the store
    pub fn pending_payment(&self, product_id: &str) -> Result<Option<PaymentRecord>> {
        Ok(self
            .payments_for_product(product_id)?
            .into_iter()
            .find(|p| p.status == PaymentStatus::Purchasing && p.transaction_id.is_none()))
    }

    pub fn record_event(&self, event: &Event) -> Result<()> {
        let conn = self.lock()?;
        insert_event(&conn, event)
    }

    pub fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let conn = self.lock()?;
        get_events_for_entity(&conn, entity_type, entity_id)
    }

    pub fn save_store_transaction(&self, tx: &StoreTransaction) -> Result<()> {
        let conn = self.lock()?;
        upsert_store_transaction(&conn, tx)
    }

    pub fn finish_store_transaction(&self, transaction_id: &str) -> Result<()> {
        let conn = self.lock()?;
        mark_store_transaction_finished(&conn, transaction_id)
    }

    pub fn store_transactions(&self) -> Result<Vec<(StoreTransaction, bool)>> {
        let conn = self.lock()?;
        get_store_transactions(&conn)
    }

    pub fn add_deferred_product(&self, product_id: &str) -> Result<()> {
        let conn = self.lock()?;
        insert_deferred_product(&conn, product_id)
    }

    pub fn remove_deferred_product(&self, product_id: &str) -> Result<()> {
        let conn = self.lock()?;
        delete_deferred_product(&conn, product_id)
    }

    pub fn deferred_products(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        get_deferred_products(&conn)
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        kv_get(&conn, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        kv_set(&conn, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        kv_delete(&conn, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_upsert_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        assert_eq!(kv_get(&conn, "k").unwrap(), None);

        kv_set(&conn, "k", "[\"a\"]").unwrap();
        kv_set(&conn, "k", "[\"a\",\"b\"]").unwrap();
        assert_eq!(kv_get(&conn, "k").unwrap().as_deref(), Some("[\"a\",\"b\"]"));

        kv_delete(&conn, "k").unwrap();
        assert_eq!(kv_get(&conn, "k").unwrap(), None);
    }

    #[test]
    fn test_payment_history() {
        let db = Database::open_in_memory().unwrap();

        let first = PaymentRecord::new(
            "local",
            "com.app.widget.premium_clock_1",
            Decimal::from(480),
            "JPY",
            PaymentStatus::NotPurchased,
        );
        let second = PaymentRecord::new(
            "local",
            "com.app.widget.premium_clock_1",
            Decimal::from(480),
            "JPY",
            PaymentStatus::Purchased,
        );
        db.record_payment(&first).unwrap();
        db.record_payment(&second).unwrap();

        let history = db
            .payments_for_product("com.app.widget.premium_clock_1")
            .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, PaymentStatus::Purchased, "newest first");
        assert_eq!(history[1].status, PaymentStatus::NotPurchased);
        assert_eq!(history[0].amount, Decimal::from(480));

        assert!(db.payments_for_product("other").unwrap().is_empty());
    }

    #[test]
    fn test_event_log() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let event = Event::new(
            "entitlement_revoked",
            "product",
            "com.app.widget.premium_clock_1",
            serde_json::json!({"transaction_id": "tx-1"}),
            "transaction_listener",
        );

        insert_event(&conn, &event).unwrap();

        let events =
            get_events_for_entity(&conn, "product", "com.app.widget.premium_clock_1").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "entitlement_revoked");
        assert_eq!(events[0].actor, "transaction_listener");
        assert_eq!(events[0].data["transaction_id"], "tx-1");
    }

    #[test]
    fn test_database_reopens_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entitlements.db");

        {
            let db = Database::open(&path).unwrap();
            db.set("purchased", "[\"p1\"]").unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get("purchased").unwrap().as_deref(), Some("[\"p1\"]"));

        println!("✅ Shared container persistence test PASSED");
    }

    #[test]
    fn test_payment_status_update() {
        let db = Database::open_in_memory().unwrap();
        let pending = PaymentRecord::new(
            "local",
            "com.app.widget.premium_clock_1",
            Decimal::from(480),
            "JPY",
            PaymentStatus::Purchasing,
        );
        db.record_payment(&pending).unwrap();

        assert_eq!(
            db.pending_payment("com.app.widget.premium_clock_1")
                .unwrap()
                .map(|p| p.id),
            Some(pending.id.clone())
        );

        assert!(db
            .update_payment_status(&pending.id, PaymentStatus::Purchased, Some("tx-9"))
            .unwrap());
        assert!(!db
            .update_payment_status("missing", PaymentStatus::Purchased, None)
            .unwrap());

        let settled = db.payment_for_transaction("tx-9").unwrap().unwrap();
        assert_eq!(settled.id, pending.id);
        assert_eq!(settled.status, PaymentStatus::Purchased);
        assert!(settled.updated_at >= settled.created_at);
        assert!(db
            .pending_payment("com.app.widget.premium_clock_1")
            .unwrap()
            .is_none());

        // Status-only update keeps the transaction id
        db.update_payment_status(&pending.id, PaymentStatus::Refunded, None)
            .unwrap();
        let refunded = db.payment_for_transaction("tx-9").unwrap().unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
    }

    #[test]
    fn test_sandbox_ledger_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut tx = StoreTransaction {
            id: "tx-1".to_string(),
            original_id: "tx-1".to_string(),
            product_id: "com.app.widget.premium_clock_1".to_string(),
            purchase_date: Utc::now(),
            revocation_date: None,
            signature: "sig".to_string(),
        };

        db.save_store_transaction(&tx).unwrap();
        db.finish_store_transaction("tx-1").unwrap();

        tx.revocation_date = Some(Utc::now());
        tx.signature = "sig-2".to_string();
        db.save_store_transaction(&tx).unwrap();

        let ledger = db.store_transactions().unwrap();
        assert_eq!(ledger.len(), 1);
        let (stored, finished) = &ledger[0];
        assert!(finished);
        assert!(stored.is_revoked());
        assert_eq!(stored.signature, "sig-2");

        db.add_deferred_product("com.app.widget.premium_wallpaper_1").unwrap();
        db.add_deferred_product("com.app.widget.premium_wallpaper_1").unwrap();
        assert_eq!(db.deferred_products().unwrap().len(), 1);
        db.remove_deferred_product("com.app.widget.premium_wallpaper_1").unwrap();
        assert!(db.deferred_products().unwrap().is_empty());
    }
}
