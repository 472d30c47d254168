use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{opt_from_millis, to_millis, DatabaseManager};
use crate::types::{CampaignId, LeadId};

/// Lead status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    /// A call is in progress or finished without a disposition
    Called,
    Callback,
    Interested,
    NotInterested,
    Sale,
    Dnc,
    Invalid,
    NoAnswer,
    Busy,
    Failed,
    /// Answered but no agent was free
    Dropped,
    Machine,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Called => "called",
            LeadStatus::Callback => "callback",
            LeadStatus::Interested => "interested",
            LeadStatus::NotInterested => "not_interested",
            LeadStatus::Sale => "sale",
            LeadStatus::Dnc => "dnc",
            LeadStatus::Invalid => "invalid",
            LeadStatus::NoAnswer => "no_answer",
            LeadStatus::Busy => "busy",
            LeadStatus::Failed => "failed",
            LeadStatus::Dropped => "dropped",
            LeadStatus::Machine => "machine",
        }
    }

    /// Outcomes that put the lead back in line for another attempt
    pub fn is_recyclable(&self) -> bool {
        matches!(
            self,
            LeadStatus::NoAnswer
                | LeadStatus::Busy
                | LeadStatus::Failed
                | LeadStatus::Dropped
                | LeadStatus::Machine
        )
    }

    /// Statuses that may never be dialed again
    pub fn is_final(&self) -> bool {
        matches!(self, LeadStatus::Sale | LeadStatus::Dnc | LeadStatus::Invalid)
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "new" => LeadStatus::New,
            "called" => LeadStatus::Called,
            "callback" => LeadStatus::Callback,
            "interested" => LeadStatus::Interested,
            "not_interested" => LeadStatus::NotInterested,
            "sale" => LeadStatus::Sale,
            "dnc" => LeadStatus::Dnc,
            "invalid" => LeadStatus::Invalid,
            "no_answer" => LeadStatus::NoAnswer,
            "busy" => LeadStatus::Busy,
            "failed" => LeadStatus::Failed,
            "dropped" => LeadStatus::Dropped,
            "machine" => LeadStatus::Machine,
            other => return Err(anyhow!("unknown lead status '{}'", other)),
        })
    }
}

/// A dialable contact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub campaign_id: CampaignId,
    pub phone_number: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: LeadStatus,
    pub priority: i32,
    pub call_count: u32,
    pub last_called_at: Option<DateTime<Utc>>,
    pub callback_at: Option<DateTime<Utc>>,
}

impl Lead {
    /// Whether the status allows a dial at `now`. Attempt limits and backoff
    /// are the recycle policy's business.
    pub fn is_dialable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            LeadStatus::New => true,
            LeadStatus::Callback => self.callback_at.map_or(true, |at| at <= now),
            status => status.is_recyclable(),
        }
    }
}

/// Lead to insert
#[derive(Debug, Clone, Default)]
pub struct NewLead {
    pub campaign_id: CampaignId,
    pub phone_number: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub priority: i32,
}

impl NewLead {
    pub fn new(campaign_id: CampaignId, phone_number: impl Into<String>) -> Self {
        Self {
            campaign_id,
            phone_number: phone_number.into(),
            ..Default::default()
        }
    }
}

#[derive(sqlx::FromRow)]
struct LeadRow {
    id: i64,
    campaign_id: i64,
    phone_number: String,
    first_name: Option<String>,
    last_name: Option<String>,
    status: String,
    priority: i64,
    call_count: i64,
    last_called_at: Option<i64>,
    callback_at: Option<i64>,
}

impl TryFrom<LeadRow> for Lead {
    type Error = anyhow::Error;

    fn try_from(row: LeadRow) -> Result<Self> {
        Ok(Lead {
            id: row.id,
            campaign_id: row.campaign_id,
            phone_number: row.phone_number,
            first_name: row.first_name,
            last_name: row.last_name,
            status: row.status.parse()?,
            priority: row.priority as i32,
            call_count: row.call_count.max(0) as u32,
            last_called_at: opt_from_millis(row.last_called_at),
            callback_at: opt_from_millis(row.callback_at),
        })
    }
}

const LEAD_COLUMNS: &str = "id, campaign_id, phone_number, first_name, last_name, status, \
     priority, call_count, last_called_at, callback_at";

impl DatabaseManager {
    pub async fn create_lead(&self, lead: &NewLead) -> Result<LeadId> {
        let result = sqlx::query(
            "INSERT INTO leads (campaign_id, phone_number, first_name, last_name, priority)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(lead.campaign_id)
        .bind(&lead.phone_number)
        .bind(&lead.first_name)
        .bind(&lead.last_name)
        .bind(lead.priority as i64)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_lead(&self, id: LeadId) -> Result<Option<Lead>> {
        let sql = format!("SELECT {} FROM leads WHERE id = ?", LEAD_COLUMNS);
        let row: Option<LeadRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(Lead::try_from).transpose()
    }

    /// Candidate leads for the hopper, best first: priority, then the lead
    /// that has waited longest since its last call, then the fewest attempts.
    /// Numbers on the internal do-not-call list are never returned. Backoff is
    /// applied by the caller.
    pub async fn fetch_dialable_leads(
        &self,
        campaign_id: CampaignId,
        max_attempts: u32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Lead>> {
        let sql = format!(
            "SELECT {} FROM leads l
             WHERE l.campaign_id = ?
               AND (
                    (l.status = 'callback' AND (l.callback_at IS NULL OR l.callback_at <= ?))
                 OR (l.call_count < ?
                     AND l.status IN ('new', 'no_answer', 'busy', 'failed', 'dropped', 'machine'))
               )
               AND NOT EXISTS (SELECT 1 FROM dnc_numbers d WHERE d.phone_number = l.phone_number)
             ORDER BY l.priority DESC, COALESCE(l.last_called_at, 0) ASC, l.call_count ASC, l.id ASC
             LIMIT ?",
            LEAD_COLUMNS
        );

        let rows: Vec<LeadRow> = sqlx::query_as(&sql)
            .bind(campaign_id)
            .bind(to_millis(now))
            .bind(max_attempts as i64)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        rows.into_iter().map(Lead::try_from).collect()
    }

    /// Count a dial attempt against the lead and mark it as being called
    pub async fn record_dial_attempt(&self, id: LeadId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE leads
             SET call_count = call_count + 1, last_called_at = ?, status = 'called'
             WHERE id = ?",
        )
        .bind(to_millis(at))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Set a lead's status. A `dnc` lead keeps its status whatever is asked.
    pub async fn update_lead_status(
        &self,
        id: LeadId,
        status: LeadStatus,
        callback_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE leads SET status = ?, callback_at = ? WHERE id = ? AND status != 'dnc'",
        )
        .bind(status.as_str())
        .bind(callback_at.map(to_millis))
        .bind(id)
        .execute(self.pool())
        .await?;

        debug!("Lead {} status -> {}", id, status);
        Ok(result.rows_affected() > 0)
    }

    /// Move leads that have rested long enough from one status to another.
    /// Returns the number of leads changed.
    pub async fn recycle_leads(
        &self,
        source: LeadStatus,
        target: LeadStatus,
        called_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE leads SET status = ?
             WHERE status = ?
               AND (last_called_at IS NULL OR last_called_at <= ?)
               AND call_count < ?",
        )
        .bind(target.as_str())
        .bind(source.as_str())
        .bind(to_millis(called_before))
        .bind(max_attempts as i64)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(status: LeadStatus) -> Lead {
        Lead {
            id: 1,
            campaign_id: 1,
            phone_number: "5550100".to_string(),
            first_name: None,
            last_name: None,
            status,
            priority: 0,
            call_count: 0,
            last_called_at: None,
            callback_at: None,
        }
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            LeadStatus::New,
            LeadStatus::NotInterested,
            LeadStatus::NoAnswer,
            LeadStatus::Dnc,
            LeadStatus::Machine,
        ] {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn test_final_statuses_are_never_dialable() {
        let now = Utc::now();
        for status in [LeadStatus::Sale, LeadStatus::Dnc, LeadStatus::Invalid] {
            assert!(status.is_final());
            assert!(!lead(status).is_dialable(now));
        }
        assert!(!lead(LeadStatus::Called).is_dialable(now));
        assert!(lead(LeadStatus::Busy).is_dialable(now));
    }

    #[test]
    fn test_callback_waits_for_its_time() {
        let now = Utc::now();
        let mut callback = lead(LeadStatus::Callback);
        callback.callback_at = Some(now + chrono::Duration::minutes(5));
        assert!(!callback.is_dialable(now));
        assert!(callback.is_dialable(now + chrono::Duration::minutes(6)));
    }
}
