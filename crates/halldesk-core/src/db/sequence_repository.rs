//! Sequence counter and offer numbering repository

use crate::error::{Error, Result};
use crate::models::{PendingOfferNumber, Renumbered, SequenceKey, TEMPORARY_MARKER};
use libsql::{params, Connection};

use super::connection::optional_text;

/// libSQL-backed sequence counters plus the offer number column they feed
pub struct LibSqlSequenceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSequenceRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Hand out the next sequence for `key`.
    ///
    /// A single upsert: a missing counter is created with `next_sequence = 2`
    /// and yields 1; an existing counter is incremented and yields the value
    /// it held before.
    pub async fn next_sequence(&self, key: &SequenceKey, now: i64) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO sequence_counters (
                    prefix, owner_initial, year, counter_key, next_sequence, updated_at
                 ) VALUES (?, ?, ?, ?, 2, ?)
                 ON CONFLICT (prefix, owner_initial, year)
                 DO UPDATE SET next_sequence = next_sequence + 1, updated_at = excluded.updated_at
                 RETURNING next_sequence",
                params![
                    key.prefix(),
                    key.initial(),
                    i64::from(key.year()),
                    key.counter_key(),
                    now
                ],
            )
            .await?;

        let next: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => {
                return Err(Error::Database(format!(
                    "sequence upsert for {} returned no row",
                    key.counter_key()
                )))
            }
        };
        Ok(next - 1)
    }

    /// Peek at the next value `key` would hand out, without allocating
    pub async fn peek(&self, key: &SequenceKey) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT next_sequence FROM sequence_counters
                 WHERE prefix = ? AND owner_initial = ? AND year = ?",
                params![key.prefix(), key.initial(), i64::from(key.year())],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Make sure the counter for `key` never hands out a value below `at_least`
    pub async fn fast_forward(&self, key: &SequenceKey, at_least: i64, now: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sequence_counters (
                    prefix, owner_initial, year, counter_key, next_sequence, updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (prefix, owner_initial, year)
                 DO UPDATE SET next_sequence = MAX(next_sequence, excluded.next_sequence),
                               updated_at = excluded.updated_at",
                params![
                    key.prefix(),
                    key.initial(),
                    i64::from(key.year()),
                    key.counter_key(),
                    at_least,
                    now
                ],
            )
            .await?;
        Ok(())
    }

    /// Offers whose number still carries the temporary marker, oldest first
    pub async fn pending_offers(&self) -> Result<Vec<PendingOfferNumber>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, offer_number, salesperson_initial, created_at
                 FROM offers
                 WHERE substr(offer_number, 1, ?) = ?
                 ORDER BY created_at ASC, id ASC",
                params![
                    i64::try_from(TEMPORARY_MARKER.len()).unwrap_or(i64::MAX),
                    TEMPORARY_MARKER
                ],
            )
            .await?;

        let mut offers = Vec::new();
        while let Some(row) = rows.next().await? {
            offers.push(PendingOfferNumber {
                offer_id: row.get(0)?,
                offer_number: row.get(1)?,
                salesperson_initial: optional_text(&row, 2)?,
                created_at: row.get(3)?,
            });
        }
        Ok(offers)
    }

    /// Rewrite one offer number and append the audit row in one transaction.
    ///
    /// Fails without writing when the offer no longer carries `old_number`.
    pub async fn apply_renumbering(
        &self,
        offer_id: &str,
        old_number: &str,
        new_number: &str,
        now: i64,
    ) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        let updated = match self
            .conn
            .execute(
                "UPDATE offers SET offer_number = ? WHERE id = ? AND offer_number = ?",
                params![new_number, offer_id, old_number],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        };
        if updated == 0 {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(Error::NotFound(format!(
                "offer {offer_id} no longer carries number {old_number}"
            )));
        }

        if let Err(e) = self
            .conn
            .execute(
                "INSERT INTO offer_renumbering (offer_id, old_number, new_number, renumbered_at)
                 VALUES (?, ?, ?, ?)",
                params![offer_id, old_number, new_number, now],
            )
            .await
        {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    /// Audit trail of renumbered offers, oldest first
    pub async fn renumbering_log(&self) -> Result<Vec<Renumbered>> {
        let mut rows = self
            .conn
            .query(
                "SELECT offer_id, old_number, new_number FROM offer_renumbering ORDER BY id ASC",
                (),
            )
            .await?;
        let mut log = Vec::new();
        while let Some(row) = rows.next().await? {
            log.push(Renumbered {
                offer_id: row.get(0)?,
                old_number: row.get(1)?,
                new_number: row.get(2)?,
            });
        }
        Ok(log)
    }
}
