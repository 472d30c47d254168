//! Audit trail of agent sessions. The live session registry is in memory;
//! these rows record logins and how each session ended.

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{from_millis, opt_from_millis, to_millis, DatabaseManager};
use crate::agent::session::{AgentSession, SessionState};
use crate::types::{AgentId, CampaignId};

/// Stored session row
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_id: AgentId,
    pub campaign_id: CampaignId,
    pub server_id: String,
    pub endpoint: String,
    pub state: SessionState,
    pub login_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    agent_id: String,
    campaign_id: i64,
    server_id: String,
    endpoint: String,
    state: String,
    login_at: i64,
    ended_at: Option<i64>,
    end_reason: Option<String>,
}

impl DatabaseManager {
    pub async fn record_session_opened(&self, session: &AgentSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_sessions (session_id, agent_id, campaign_id, server_id, endpoint,
                state, login_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.session_id.to_string())
        .bind(session.agent_id.as_str())
        .bind(session.campaign_id)
        .bind(&session.server_id)
        .bind(&session.endpoint)
        .bind(session.state.as_str())
        .bind(to_millis(session.login_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_session_state(&self, session: &AgentSession) -> Result<()> {
        sqlx::query(
            "UPDATE agent_sessions SET state = ?, ended_at = ?, end_reason = ?
             WHERE session_id = ?",
        )
        .bind(session.state.as_str())
        .bind(session.ended_at.map(to_millis))
        .bind(&session.end_reason)
        .bind(session.session_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_agent_sessions(&self, agent_id: &AgentId) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT session_id, agent_id, campaign_id, server_id, endpoint, state, login_at,
                    ended_at, end_reason
             FROM agent_sessions WHERE agent_id = ? ORDER BY login_at",
        )
        .bind(agent_id.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SessionRecord> {
                Ok(SessionRecord {
                    session_id: row.session_id,
                    agent_id: AgentId(row.agent_id),
                    campaign_id: row.campaign_id,
                    server_id: row.server_id,
                    endpoint: row.endpoint,
                    state: row.state.parse()?,
                    login_at: from_millis(row.login_at),
                    ended_at: opt_from_millis(row.ended_at),
                    end_reason: row.end_reason,
                })
            })
            .collect()
    }
}
