use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{to_millis, DatabaseManager};
use crate::types::LeadId;

impl DatabaseManager {
    /// Put a number on the internal do-not-call list and mark every lead
    /// with that number as `dnc`. Returns the leads that were marked.
    pub async fn add_dnc_number(
        &self,
        phone_number: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<LeadId>> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO dnc_numbers (phone_number, reason, added_at) VALUES (?, ?, ?)",
        )
        .bind(phone_number)
        .bind(reason)
        .bind(to_millis(at))
        .execute(&mut *tx)
        .await?;

        let marked: Vec<LeadId> = sqlx::query_scalar("SELECT id FROM leads WHERE phone_number = ?")
            .bind(phone_number)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("UPDATE leads SET status = 'dnc' WHERE phone_number = ?")
            .bind(phone_number)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            "🚫 {} added to do-not-call list ({} lead(s) updated)",
            phone_number,
            marked.len()
        );
        Ok(marked)
    }

    pub async fn is_dnc_number(&self, phone_number: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM dnc_numbers WHERE phone_number = ?")
                .bind(phone_number)
                .fetch_optional(self.pool())
                .await?;
        Ok(found.is_some())
    }
}
