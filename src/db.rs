use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::{
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokio::task;

use crate::error::LedgerError;
use crate::models::{FailedAttempt, PayoutIntent, SignedPayout, SwapRecord};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS swaps (
  id               INTEGER PRIMARY KEY AUTOINCREMENT,
  sender           TEXT NOT NULL,
  usdc_received    TEXT NOT NULL, -- U256 stored as decimal string
  arb_amount       TEXT NOT NULL,
  arb_price        TEXT NOT NULL, -- Decimal stored as string
  fee              TEXT NOT NULL,
  block_number     INTEGER NOT NULL,
  incoming_tx_hash TEXT NOT NULL UNIQUE,
  outgoing_tx_hash TEXT NOT NULL,
  created_at       TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS swaps_block_number ON swaps (block_number);

CREATE TABLE IF NOT EXISTS failed_attempts (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  event      TEXT NOT NULL, -- serialized TransferEvent
  error      TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payout_intents (
  incoming_tx_hash TEXT NOT NULL PRIMARY KEY,
  sender           TEXT NOT NULL,
  usdc_received    TEXT NOT NULL,
  arb_amount       TEXT NOT NULL,
  arb_price        TEXT NOT NULL,
  fee              TEXT NOT NULL,
  block_number     INTEGER NOT NULL,
  outgoing_tx_hash TEXT,    -- set together with the two columns below
  payout_nonce     INTEGER,
  payout_raw       TEXT,    -- hex of the signed transaction
  created_at       TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> Result<Connection, LedgerError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

/// Durable settlement state: the idempotency source of truth and resume point.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Returns false if a record with the same incoming hash already exists.
    /// The settlement worker goes through `complete_swap`, which performs the
    /// same insert inside the transaction that closes the intent.
    async fn insert_swap_record(&self, record: &SwapRecord) -> Result<bool, LedgerError>;
    async fn exists_by_incoming_hash(&self, hash: &str) -> Result<bool, LedgerError>;
    /// Highest block with a settled swap, if any.
    async fn latest_persisted_block(&self) -> Result<Option<u64>, LedgerError>;

    async fn insert_failed_attempt(&self, event: &str, message: &str) -> Result<(), LedgerError>;
    async fn all_failed_attempts(&self) -> Result<Vec<FailedAttempt>, LedgerError>;
    /// Deletes exactly the given rows; anything newer stays.
    async fn delete_failed_attempts(&self, ids: &[i64]) -> Result<usize, LedgerError>;

    async fn open_intent(&self, intent: &PayoutIntent) -> Result<(), LedgerError>;
    /// Must succeed before the payout is broadcast.
    async fn attach_payout(&self, incoming: &str, payout: &SignedPayout) -> Result<(), LedgerError>;
    async fn find_intent(&self, incoming: &str) -> Result<Option<PayoutIntent>, LedgerError>;
    async fn clear_intent(&self, incoming: &str) -> Result<(), LedgerError>;
    /// Records the swap and closes its intent in one transaction.
    async fn complete_swap(&self, record: &SwapRecord) -> Result<bool, LedgerError>;
}

/// `Ledger` over a single shared SQLite connection.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

fn corrupt<E: std::fmt::Display>(what: &str, e: E) -> LedgerError {
    LedgerError::Corrupt(format!("{}: {}", what, e))
}

fn insert_swap(conn: &Connection, r: &SwapRecord) -> Result<bool, LedgerError> {
    let changed = conn.execute(
        r#"
        INSERT INTO swaps (
            sender, usdc_received, arb_amount, arb_price, fee,
            block_number, incoming_tx_hash, outgoing_tx_hash
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(incoming_tx_hash) DO NOTHING
        "#,
        params![
            r.sender.to_string(),
            r.usdc_received.to_string(),
            r.arb_amount.to_string(),
            r.arb_price.to_string(),
            r.fee.to_string(),
            r.block_number as i64,
            r.incoming_tx_hash,
            r.outgoing_tx_hash,
        ],
    )?;
    Ok(changed == 1)
}

impl SqliteLedger {
    pub fn new(conn: Connection) -> Self {
        Self { conn: Arc::new(Mutex::new(conn)) }
    }

    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = connect(path)?;
        run_migrations(&conn)?;
        Ok(Self::new(conn))
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory sqlite");
        run_migrations(&conn).expect("migrations");
        Self::new(conn)
    }

    // Runs `f` on the blocking pool with the connection locked.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut db = conn.lock().map_err(|_| LedgerError::Poisoned)?;
            f(&mut *db)
        })
        .await?
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn insert_swap_record(&self, record: &SwapRecord) -> Result<bool, LedgerError> {
        let record = record.clone();
        self.with_conn(move |db| insert_swap(db, &record)).await
    }

    async fn exists_by_incoming_hash(&self, hash: &str) -> Result<bool, LedgerError> {
        let hash = hash.to_lowercase();
        self.with_conn(move |db| {
            let found = db
                .query_row(
                    "SELECT 1 FROM swaps WHERE incoming_tx_hash = ?1",
                    [hash],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn latest_persisted_block(&self) -> Result<Option<u64>, LedgerError> {
        self.with_conn(|db| {
            let block: Option<i64> =
                db.query_row("SELECT MAX(block_number) FROM swaps", [], |r| r.get(0))?;
            Ok(block.map(|b| b as u64))
        })
        .await
    }

    async fn insert_failed_attempt(&self, event: &str, message: &str) -> Result<(), LedgerError> {
        let (event, message) = (event.to_string(), message.to_string());
        self.with_conn(move |db| {
            db.execute(
                "INSERT INTO failed_attempts (event, error, created_at) VALUES (?1, ?2, ?3)",
                params![event, message, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn all_failed_attempts(&self) -> Result<Vec<FailedAttempt>, LedgerError> {
        self.with_conn(|db| {
            let mut stmt =
                db.prepare("SELECT id, event, error, created_at FROM failed_attempts ORDER BY id")?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?;

            let mut attempts = Vec::new();
            for row in rows {
                let (id, event, error, created_at) = row?;
                let timestamp = DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| corrupt("failed_attempts.created_at", e))?;
                attempts.push(FailedAttempt { id, event, error, timestamp });
            }
            Ok(attempts)
        })
        .await
    }

    async fn delete_failed_attempts(&self, ids: &[i64]) -> Result<usize, LedgerError> {
        let ids = ids.to_vec();
        self.with_conn(move |db| {
            let tx = db.transaction()?;
            let mut deleted = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM failed_attempts WHERE id = ?1")?;
                for id in ids {
                    deleted += stmt.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn open_intent(&self, intent: &PayoutIntent) -> Result<(), LedgerError> {
        let i = intent.clone();
        self.with_conn(move |db| {
            db.execute(
                r#"
                INSERT INTO payout_intents (
                    incoming_tx_hash, sender, usdc_received, arb_amount,
                    arb_price, fee, block_number,
                    outgoing_tx_hash, payout_nonce, payout_raw
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    i.incoming_tx_hash,
                    i.sender.to_string(),
                    i.usdc_received.to_string(),
                    i.arb_amount.to_string(),
                    i.arb_price.to_string(),
                    i.fee.to_string(),
                    i.block_number as i64,
                    i.payout.as_ref().map(|p| p.hash.clone()),
                    i.payout.as_ref().map(|p| p.nonce as i64),
                    i.payout.as_ref().map(|p| hex::encode(&p.raw)),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn attach_payout(&self, incoming: &str, payout: &SignedPayout) -> Result<(), LedgerError> {
        let (incoming, payout) = (incoming.to_string(), payout.clone());
        self.with_conn(move |db| {
            let changed = db.execute(
                r#"
                UPDATE payout_intents
                SET outgoing_tx_hash = ?2, payout_nonce = ?3, payout_raw = ?4
                WHERE incoming_tx_hash = ?1
                "#,
                params![incoming, payout.hash, payout.nonce as i64, hex::encode(&payout.raw)],
            )?;
            if changed == 0 {
                return Err(LedgerError::Corrupt(format!("no payout intent for {}", incoming)));
            }
            Ok(())
        })
        .await
    }

    async fn find_intent(&self, incoming: &str) -> Result<Option<PayoutIntent>, LedgerError> {
        let incoming = incoming.to_string();
        self.with_conn(move |db| {
            let row = db
                .query_row(
                    r#"
                    SELECT sender, usdc_received, arb_amount, arb_price, fee,
                           block_number, incoming_tx_hash,
                           outgoing_tx_hash, payout_nonce, payout_raw
                    FROM payout_intents WHERE incoming_tx_hash = ?1
                    "#,
                    [incoming],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, String>(3)?,
                            r.get::<_, String>(4)?,
                            r.get::<_, i64>(5)?,
                            r.get::<_, String>(6)?,
                            r.get::<_, Option<String>>(7)?,
                            r.get::<_, Option<i64>>(8)?,
                            r.get::<_, Option<String>>(9)?,
                        ))
                    },
                )
                .optional()?;

            let Some((sender, received, amount, price, fee, block, incoming, hash, nonce, raw)) = row
            else {
                return Ok(None);
            };
            let payout = match (hash, nonce, raw) {
                (Some(hash), Some(nonce), Some(raw)) => Some(SignedPayout {
                    hash,
                    nonce: nonce as u64,
                    raw: hex::decode(&raw).map_err(|e| corrupt("payout_raw", e))?,
                }),
                (None, None, None) => None,
                _ => return Err(LedgerError::Corrupt(format!("partial payout for {}", incoming))),
            };
            Ok(Some(PayoutIntent {
                sender: Address::from_str(&sender).map_err(|e| corrupt("sender", e))?,
                usdc_received: U256::from_str(&received).map_err(|e| corrupt("usdc_received", e))?,
                arb_amount: U256::from_str(&amount).map_err(|e| corrupt("arb_amount", e))?,
                arb_price: Decimal::from_str(&price).map_err(|e| corrupt("arb_price", e))?,
                fee: U256::from_str(&fee).map_err(|e| corrupt("fee", e))?,
                block_number: block as u64,
                incoming_tx_hash: incoming,
                payout,
            }))
        })
        .await
    }

    async fn clear_intent(&self, incoming: &str) -> Result<(), LedgerError> {
        let incoming = incoming.to_string();
        self.with_conn(move |db| {
            db.execute(
                "DELETE FROM payout_intents WHERE incoming_tx_hash = ?1",
                [incoming],
            )?;
            Ok(())
        })
        .await
    }

    async fn complete_swap(&self, record: &SwapRecord) -> Result<bool, LedgerError> {
        let record = record.clone();
        self.with_conn(move |db| {
            let tx = db.transaction()?;
            let inserted = insert_swap(&tx, &record)?;
            tx.execute(
                "DELETE FROM payout_intents WHERE incoming_tx_hash = ?1",
                [&record.incoming_tx_hash],
            )?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SENDER;

    fn record(incoming: &str, block: u64) -> SwapRecord {
        SwapRecord {
            sender: SENDER,
            usdc_received: U256::from(1_000_000u64),
            arb_amount: U256::from(495_000_000_000_000_000u64),
            arb_price: Decimal::from_str("2.0").unwrap(),
            fee: U256::from(10_000u64),
            block_number: block,
            incoming_tx_hash: incoming.to_string(),
            outgoing_tx_hash: format!("{}ff", incoming),
        }
    }

    fn intent(incoming: &str) -> PayoutIntent {
        let r = record(incoming, 12);
        PayoutIntent {
            sender: r.sender,
            usdc_received: r.usdc_received,
            arb_amount: r.arb_amount,
            arb_price: r.arb_price,
            fee: r.fee,
            block_number: r.block_number,
            incoming_tx_hash: r.incoming_tx_hash,
            payout: None,
        }
    }

    fn signed(hash: &str, nonce: u64) -> SignedPayout {
        SignedPayout { hash: hash.to_string(), nonce, raw: vec![0x02, 0xf8, 0x6c, nonce as u8] }
    }

    #[tokio::test]
    async fn swap_records_are_unique_by_incoming_hash() {
        let ledger = SqliteLedger::in_memory();
        assert!(ledger.insert_swap_record(&record("0xaa", 10)).await.unwrap());
        assert!(!ledger.insert_swap_record(&record("0xaa", 11)).await.unwrap());
        assert!(ledger.exists_by_incoming_hash("0xaa").await.unwrap());
        assert!(ledger.exists_by_incoming_hash("0xAA").await.unwrap());
        assert!(!ledger.exists_by_incoming_hash("0xbb").await.unwrap());
    }

    #[tokio::test]
    async fn latest_block_tracks_max() {
        let ledger = SqliteLedger::in_memory();
        assert_eq!(ledger.latest_persisted_block().await.unwrap(), None);
        ledger.insert_swap_record(&record("0x01", 30)).await.unwrap();
        ledger.insert_swap_record(&record("0x02", 20)).await.unwrap();
        assert_eq!(ledger.latest_persisted_block().await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn failed_attempts_delete_only_listed_rows() {
        let ledger = SqliteLedger::in_memory();
        ledger.insert_failed_attempt("{\"a\":1}", "boom").await.unwrap();
        ledger.insert_failed_attempt("{\"a\":2}", "bang").await.unwrap();

        let rows = ledger.all_failed_attempts().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].error, "boom");

        ledger.insert_failed_attempt("{\"a\":3}", "late").await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ledger.delete_failed_attempts(&ids).await.unwrap(), 2);

        let left = ledger.all_failed_attempts().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].error, "late");
    }

    #[tokio::test]
    async fn intent_lifecycle() {
        let ledger = SqliteLedger::in_memory();
        ledger.open_intent(&intent("0xcc")).await.unwrap();
        assert_eq!(ledger.find_intent("0xcc").await.unwrap(), Some(intent("0xcc")));

        ledger.attach_payout("0xcc", &signed("0xdd", 7)).await.unwrap();
        let open = ledger.find_intent("0xcc").await.unwrap().unwrap();
        assert_eq!(open.payout, Some(signed("0xdd", 7)));

        let record = open.into_record("0xdd".to_string());
        assert!(ledger.complete_swap(&record).await.unwrap());
        assert_eq!(ledger.find_intent("0xcc").await.unwrap(), None);
        assert!(ledger.exists_by_incoming_hash("0xcc").await.unwrap());
    }

    #[tokio::test]
    async fn completed_swap_and_direct_insert_share_a_row() {
        let ledger = SqliteLedger::in_memory();
        ledger.open_intent(&intent("0xab")).await.unwrap();
        assert!(ledger.complete_swap(&record("0xab", 12)).await.unwrap());
        assert!(!ledger.insert_swap_record(&record("0xab", 12)).await.unwrap());
        assert_eq!(ledger.latest_persisted_block().await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn partial_payout_columns_are_corrupt() {
        let ledger = SqliteLedger::in_memory();
        ledger.open_intent(&intent("0xac")).await.unwrap();
        ledger
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE payout_intents SET outgoing_tx_hash = '0x01' WHERE incoming_tx_hash = '0xac'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(ledger.find_intent("0xac").await, Err(LedgerError::Corrupt(_))));
    }

    #[tokio::test]
    async fn attaching_to_missing_intent_fails() {
        let ledger = SqliteLedger::in_memory();
        assert!(matches!(
            ledger.attach_payout("0xee", &signed("0xff", 1)).await,
            Err(LedgerError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn on_disk_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settler.db");
        let path = path.to_str().unwrap();

        {
            let ledger = SqliteLedger::open(path).unwrap();
            ledger.insert_swap_record(&record("0x0a", 99)).await.unwrap();
            ledger.insert_failed_attempt("{}", "x").await.unwrap();
        }

        let ledger = SqliteLedger::open(path).unwrap();
        assert_eq!(ledger.latest_persisted_block().await.unwrap(), Some(99));
        assert_eq!(ledger.all_failed_attempts().await.unwrap().len(), 1);
    }
}
