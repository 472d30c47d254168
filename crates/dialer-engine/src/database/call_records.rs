use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{from_millis, opt_from_millis, to_millis, DatabaseManager};
use crate::orchestrator::calls::{AttemptState, CallOutcome, DialAttempt};
use crate::types::{AgentId, CallId, CampaignId, ChannelId, LeadId};

/// Persisted view of one dial attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub campaign_id: CampaignId,
    pub lead_id: LeadId,
    pub phone_number: String,
    pub channel_id: ChannelId,
    pub server_id: String,
    pub state: AttemptState,
    pub outcome: Option<CallOutcome>,
    pub agent_id: Option<AgentId>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub bridged_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub talk_secs: Option<i64>,
    pub hangup_cause: Option<String>,
    pub disposition: Option<String>,
    pub notes: Option<String>,
}

/// Terminal facts of a call, written once
#[derive(Debug, Clone)]
pub struct CallFinalization {
    pub state: AttemptState,
    pub outcome: CallOutcome,
    pub ended_at: DateTime<Utc>,
    pub hangup_cause: Option<String>,
}

#[derive(sqlx::FromRow)]
struct CallRecordRow {
    id: String,
    campaign_id: i64,
    lead_id: i64,
    phone_number: String,
    channel_id: String,
    server_id: String,
    state: String,
    outcome: Option<String>,
    agent_id: Option<String>,
    started_at: i64,
    answered_at: Option<i64>,
    bridged_at: Option<i64>,
    ended_at: Option<i64>,
    talk_secs: Option<i64>,
    hangup_cause: Option<String>,
    disposition: Option<String>,
    notes: Option<String>,
}

impl TryFrom<CallRecordRow> for CallRecord {
    type Error = anyhow::Error;

    fn try_from(row: CallRecordRow) -> Result<Self> {
        Ok(CallRecord {
            id: row.id.parse()?,
            campaign_id: row.campaign_id,
            lead_id: row.lead_id,
            phone_number: row.phone_number,
            channel_id: ChannelId(row.channel_id),
            server_id: row.server_id,
            state: row.state.parse()?,
            outcome: row.outcome.map(|o| o.parse()).transpose()?,
            agent_id: row.agent_id.map(AgentId),
            started_at: from_millis(row.started_at),
            answered_at: opt_from_millis(row.answered_at),
            bridged_at: opt_from_millis(row.bridged_at),
            ended_at: opt_from_millis(row.ended_at),
            talk_secs: row.talk_secs,
            hangup_cause: row.hangup_cause,
            disposition: row.disposition,
            notes: row.notes,
        })
    }
}

impl DatabaseManager {
    /// Create the record for a freshly originated attempt
    pub async fn insert_call_record(&self, attempt: &DialAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_records (id, campaign_id, lead_id, phone_number, channel_id,
                server_id, state, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.call_id.to_string())
        .bind(attempt.campaign_id)
        .bind(attempt.lead_id)
        .bind(&attempt.phone_number)
        .bind(attempt.channel_id.as_str())
        .bind(&attempt.server_id)
        .bind(attempt.state.as_str())
        .bind(to_millis(attempt.created_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_call_answered(&self, id: CallId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE call_records SET state = 'answered', answered_at = COALESCE(answered_at, ?)
             WHERE id = ? AND outcome IS NULL",
        )
        .bind(to_millis(at))
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn assign_call_agent(&self, id: CallId, agent_id: &AgentId) -> Result<()> {
        sqlx::query(
            "UPDATE call_records SET state = 'matched', agent_id = ?
             WHERE id = ? AND outcome IS NULL",
        )
        .bind(agent_id.as_str())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_call_bridged(&self, id: CallId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE call_records SET state = 'bridged', bridged_at = ?
             WHERE id = ? AND outcome IS NULL",
        )
        .bind(to_millis(at))
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Write the terminal outcome. Returns `false` if the record was already
    /// finalized, which makes repeated hangup events harmless.
    pub async fn finalize_call(&self, id: CallId, finalization: &CallFinalization) -> Result<bool> {
        let ended = to_millis(finalization.ended_at);
        let result = sqlx::query(
            "UPDATE call_records
             SET state = ?, outcome = ?, ended_at = ?, hangup_cause = ?,
                 talk_secs = CASE WHEN bridged_at IS NULL THEN NULL ELSE (? - bridged_at) / 1000 END
             WHERE id = ? AND outcome IS NULL",
        )
        .bind(finalization.state.as_str())
        .bind(finalization.outcome.as_str())
        .bind(ended)
        .bind(&finalization.hangup_cause)
        .bind(ended)
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Attach a disposition. Returns `false` if the call already carries one.
    pub async fn set_call_disposition(
        &self,
        id: CallId,
        disposition: &str,
        notes: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE call_records SET disposition = ?, notes = ?
             WHERE id = ? AND disposition IS NULL",
        )
        .bind(disposition)
        .bind(notes)
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_call_record(&self, id: CallId) -> Result<Option<CallRecord>> {
        let row: Option<CallRecordRow> = sqlx::query_as(
            "SELECT id, campaign_id, lead_id, phone_number, channel_id, server_id, state, outcome,
                    agent_id, started_at, answered_at, bridged_at, ended_at, talk_secs,
                    hangup_cause, disposition, notes
             FROM call_records WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(CallRecord::try_from).transpose()
    }

    pub async fn list_call_records_for_lead(&self, lead_id: LeadId) -> Result<Vec<CallRecord>> {
        let rows: Vec<CallRecordRow> = sqlx::query_as(
            "SELECT id, campaign_id, lead_id, phone_number, channel_id, server_id, state, outcome,
                    agent_id, started_at, answered_at, bridged_at, ended_at, talk_secs,
                    hangup_cause, disposition, notes
             FROM call_records WHERE lead_id = ? ORDER BY started_at",
        )
        .bind(lead_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(CallRecord::try_from).collect()
    }
}
