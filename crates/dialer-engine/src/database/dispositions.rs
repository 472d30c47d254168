use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::leads::LeadStatus;
use super::DatabaseManager;

/// Outcome code an agent applies to a finished call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disposition {
    pub code: String,
    pub name: String,
    /// Lead status applied when none of the policy flags decide otherwise
    pub lead_status: LeadStatus,
    pub is_sale: bool,
    pub triggers_callback: bool,
    /// Default callback delay when the agent gives no explicit time
    pub callback_delay_secs: u64,
    pub triggers_dnc: bool,
    /// Return the agent to ready and available right away
    pub auto_available: bool,
}

impl Disposition {
    pub fn new(code: &str, name: &str, lead_status: LeadStatus) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            lead_status,
            is_sale: false,
            triggers_callback: false,
            callback_delay_secs: 3600,
            triggers_dnc: false,
            auto_available: true,
        }
    }
}

fn default_dispositions() -> Vec<Disposition> {
    vec![
        Disposition {
            is_sale: true,
            ..Disposition::new("SALE", "Sale", LeadStatus::Sale)
        },
        Disposition::new("NI", "Not interested", LeadStatus::NotInterested),
        Disposition {
            triggers_callback: true,
            ..Disposition::new("CB", "Callback", LeadStatus::Callback)
        },
        Disposition {
            triggers_dnc: true,
            ..Disposition::new("DNC", "Do not call", LeadStatus::Dnc)
        },
        Disposition::new("NA", "No answer", LeadStatus::NoAnswer),
        Disposition::new("BUSY", "Busy", LeadStatus::Busy),
        Disposition::new("AM", "Answering machine", LeadStatus::Machine),
        Disposition::new("WRONG", "Wrong number", LeadStatus::Invalid),
    ]
}

#[derive(sqlx::FromRow)]
struct DispositionRow {
    code: String,
    name: String,
    lead_status: String,
    is_sale: bool,
    triggers_callback: bool,
    callback_delay_secs: i64,
    triggers_dnc: bool,
    auto_available: bool,
}

impl TryFrom<DispositionRow> for Disposition {
    type Error = anyhow::Error;

    fn try_from(row: DispositionRow) -> Result<Self> {
        Ok(Disposition {
            code: row.code,
            name: row.name,
            lead_status: row.lead_status.parse()?,
            is_sale: row.is_sale,
            triggers_callback: row.triggers_callback,
            callback_delay_secs: row.callback_delay_secs.max(0) as u64,
            triggers_dnc: row.triggers_dnc,
            auto_available: row.auto_available,
        })
    }
}

impl DatabaseManager {
    pub(crate) async fn seed_default_dispositions(&self) -> Result<()> {
        for disposition in default_dispositions() {
            sqlx::query(
                "INSERT OR IGNORE INTO dispositions (code, name, lead_status, is_sale,
                    triggers_callback, callback_delay_secs, triggers_dnc, auto_available)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&disposition.code)
            .bind(&disposition.name)
            .bind(disposition.lead_status.as_str())
            .bind(disposition.is_sale)
            .bind(disposition.triggers_callback)
            .bind(disposition.callback_delay_secs as i64)
            .bind(disposition.triggers_dnc)
            .bind(disposition.auto_available)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn upsert_disposition(&self, disposition: &Disposition) -> Result<()> {
        sqlx::query(
            "INSERT INTO dispositions (code, name, lead_status, is_sale, triggers_callback,
                callback_delay_secs, triggers_dnc, auto_available)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(code) DO UPDATE SET
                name = excluded.name,
                lead_status = excluded.lead_status,
                is_sale = excluded.is_sale,
                triggers_callback = excluded.triggers_callback,
                callback_delay_secs = excluded.callback_delay_secs,
                triggers_dnc = excluded.triggers_dnc,
                auto_available = excluded.auto_available",
        )
        .bind(&disposition.code)
        .bind(&disposition.name)
        .bind(disposition.lead_status.as_str())
        .bind(disposition.is_sale)
        .bind(disposition.triggers_callback)
        .bind(disposition.callback_delay_secs as i64)
        .bind(disposition.triggers_dnc)
        .bind(disposition.auto_available)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_disposition(&self, code: &str) -> Result<Option<Disposition>> {
        let row: Option<DispositionRow> = sqlx::query_as(
            "SELECT code, name, lead_status, is_sale, triggers_callback, callback_delay_secs,
                    triggers_dnc, auto_available
             FROM dispositions WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(self.pool())
        .await?;
        row.map(Disposition::try_from).transpose()
    }

    pub async fn list_dispositions(&self) -> Result<Vec<Disposition>> {
        let rows: Vec<DispositionRow> = sqlx::query_as(
            "SELECT code, name, lead_status, is_sale, triggers_callback, callback_delay_secs,
                    triggers_dnc, auto_available
             FROM dispositions ORDER BY code",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Disposition::try_from).collect()
    }
}
