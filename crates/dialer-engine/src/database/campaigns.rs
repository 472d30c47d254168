use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::DatabaseManager;
use crate::types::CampaignId;

/// How a campaign places calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialMethod {
    /// Agents dial by hand, the scheduler does nothing
    Manual,
    /// Agents review the lead before the call, the scheduler does nothing
    Preview,
    /// One line per ready agent
    Progressive,
    /// Ratio-paced over-dialing with abandon-rate self-tuning
    Predictive,
}

impl DialMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialMethod::Manual => "manual",
            DialMethod::Preview => "preview",
            DialMethod::Progressive => "progressive",
            DialMethod::Predictive => "predictive",
        }
    }

    /// Whether the scheduler originates calls for this method
    pub fn is_auto_dial(&self) -> bool {
        matches!(self, DialMethod::Progressive | DialMethod::Predictive)
    }
}

impl FromStr for DialMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(DialMethod::Manual),
            "preview" => Ok(DialMethod::Preview),
            "progressive" => Ok(DialMethod::Progressive),
            "predictive" => Ok(DialMethod::Predictive),
            other => Err(anyhow!("unknown dial method '{}'", other)),
        }
    }
}

/// Campaign run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Paused,
    Stopped,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "stopped" => Ok(CampaignStatus::Stopped),
            other => Err(anyhow!("unknown campaign status '{}'", other)),
        }
    }
}

/// Campaign with its pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub status: CampaignStatus,
    pub dial_method: DialMethod,
    /// Current dial ratio, adjusted by the scheduler within the bounds below
    pub dial_ratio: f64,
    pub dial_ratio_min: f64,
    pub dial_ratio_max: f64,
    /// Abandon-rate threshold in percent
    pub abandon_threshold: f64,
    pub max_concurrent_calls: u32,
    pub max_lines: u32,
    pub hopper_size: u32,
    pub wrapup_timeout_secs: u64,
    /// Skip wrap-up after a call and go straight back to ready
    pub auto_available: bool,
    /// Disposition applied when wrap-up times out without one
    pub auto_wrapup_disposition: Option<String>,
    pub call_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub dial_prefix: Option<String>,
    pub caller_id: Option<String>,
    /// Telephony server to dial through; the first configured one when unset
    pub server_id: Option<String>,
    pub pause_reason: Option<String>,
}

impl Default for Campaign {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            status: CampaignStatus::Active,
            dial_method: DialMethod::Predictive,
            dial_ratio: 1.0,
            dial_ratio_min: 1.0,
            dial_ratio_max: 3.0,
            abandon_threshold: 3.0,
            max_concurrent_calls: 50,
            max_lines: 50,
            hopper_size: 100,
            wrapup_timeout_secs: 60,
            auto_available: false,
            auto_wrapup_disposition: None,
            call_timeout_secs: 30,
            max_attempts: 3,
            retry_delay_secs: 3600,
            dial_prefix: None,
            caller_id: None,
            server_id: None,
            pause_reason: None,
        }
    }
}

impl Campaign {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Dial string for a lead's number
    pub fn dial_string(&self, phone_number: &str) -> String {
        match &self.dial_prefix {
            Some(prefix) => format!("{}{}", prefix, phone_number),
            None => phone_number.to_string(),
        }
    }

    pub fn wrapup_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.wrapup_timeout_secs as i64)
    }
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: i64,
    name: String,
    status: String,
    dial_method: String,
    dial_ratio: f64,
    dial_ratio_min: f64,
    dial_ratio_max: f64,
    abandon_threshold: f64,
    max_concurrent_calls: i64,
    max_lines: i64,
    hopper_size: i64,
    wrapup_timeout_secs: i64,
    auto_available: bool,
    auto_wrapup_disposition: Option<String>,
    call_timeout_secs: i64,
    max_attempts: i64,
    retry_delay_secs: i64,
    dial_prefix: Option<String>,
    caller_id: Option<String>,
    server_id: Option<String>,
    pause_reason: Option<String>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = anyhow::Error;

    fn try_from(row: CampaignRow) -> Result<Self> {
        Ok(Campaign {
            id: row.id,
            name: row.name,
            status: row.status.parse()?,
            dial_method: row.dial_method.parse()?,
            dial_ratio: row.dial_ratio,
            dial_ratio_min: row.dial_ratio_min,
            dial_ratio_max: row.dial_ratio_max,
            abandon_threshold: row.abandon_threshold,
            max_concurrent_calls: row.max_concurrent_calls.max(0) as u32,
            max_lines: row.max_lines.max(0) as u32,
            hopper_size: row.hopper_size.max(0) as u32,
            wrapup_timeout_secs: row.wrapup_timeout_secs.max(0) as u64,
            auto_available: row.auto_available,
            auto_wrapup_disposition: row.auto_wrapup_disposition,
            call_timeout_secs: row.call_timeout_secs.max(0) as u64,
            max_attempts: row.max_attempts.max(0) as u32,
            retry_delay_secs: row.retry_delay_secs.max(0) as u64,
            dial_prefix: row.dial_prefix,
            caller_id: row.caller_id,
            server_id: row.server_id,
            pause_reason: row.pause_reason,
        })
    }
}

const CAMPAIGN_COLUMNS: &str = "id, name, status, dial_method, dial_ratio, dial_ratio_min, \
     dial_ratio_max, abandon_threshold, max_concurrent_calls, max_lines, hopper_size, \
     wrapup_timeout_secs, auto_available, auto_wrapup_disposition, call_timeout_secs, \
     max_attempts, retry_delay_secs, dial_prefix, caller_id, server_id, pause_reason";

impl DatabaseManager {
    /// Insert a campaign, returning its id. `campaign.id` is ignored.
    pub async fn create_campaign(&self, campaign: &Campaign) -> Result<CampaignId> {
        let result = sqlx::query(
            "INSERT INTO campaigns (name, status, dial_method, dial_ratio, dial_ratio_min,
                dial_ratio_max, abandon_threshold, max_concurrent_calls, max_lines, hopper_size,
                wrapup_timeout_secs, auto_available, auto_wrapup_disposition, call_timeout_secs,
                max_attempts, retry_delay_secs, dial_prefix, caller_id, server_id, pause_reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&campaign.name)
        .bind(campaign.status.as_str())
        .bind(campaign.dial_method.as_str())
        .bind(campaign.dial_ratio)
        .bind(campaign.dial_ratio_min)
        .bind(campaign.dial_ratio_max)
        .bind(campaign.abandon_threshold)
        .bind(campaign.max_concurrent_calls as i64)
        .bind(campaign.max_lines as i64)
        .bind(campaign.hopper_size as i64)
        .bind(campaign.wrapup_timeout_secs as i64)
        .bind(campaign.auto_available)
        .bind(&campaign.auto_wrapup_disposition)
        .bind(campaign.call_timeout_secs as i64)
        .bind(campaign.max_attempts as i64)
        .bind(campaign.retry_delay_secs as i64)
        .bind(&campaign.dial_prefix)
        .bind(&campaign.caller_id)
        .bind(&campaign.server_id)
        .bind(&campaign.pause_reason)
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        info!("📋 Created campaign {} ({})", id, campaign.name);
        Ok(id)
    }

    /// Replace the editable configuration of a campaign
    pub async fn update_campaign(&self, campaign: &Campaign) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET name = ?, status = ?, dial_method = ?, dial_ratio = ?,
                dial_ratio_min = ?, dial_ratio_max = ?, abandon_threshold = ?,
                max_concurrent_calls = ?, max_lines = ?, hopper_size = ?,
                wrapup_timeout_secs = ?, auto_available = ?, auto_wrapup_disposition = ?,
                call_timeout_secs = ?, max_attempts = ?, retry_delay_secs = ?,
                dial_prefix = ?, caller_id = ?, server_id = ?, pause_reason = ?
             WHERE id = ?",
        )
        .bind(&campaign.name)
        .bind(campaign.status.as_str())
        .bind(campaign.dial_method.as_str())
        .bind(campaign.dial_ratio)
        .bind(campaign.dial_ratio_min)
        .bind(campaign.dial_ratio_max)
        .bind(campaign.abandon_threshold)
        .bind(campaign.max_concurrent_calls as i64)
        .bind(campaign.max_lines as i64)
        .bind(campaign.hopper_size as i64)
        .bind(campaign.wrapup_timeout_secs as i64)
        .bind(campaign.auto_available)
        .bind(&campaign.auto_wrapup_disposition)
        .bind(campaign.call_timeout_secs as i64)
        .bind(campaign.max_attempts as i64)
        .bind(campaign.retry_delay_secs as i64)
        .bind(&campaign.dial_prefix)
        .bind(&campaign.caller_id)
        .bind(&campaign.server_id)
        .bind(&campaign.pause_reason)
        .bind(campaign.id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let sql = format!("SELECT {} FROM campaigns WHERE id = ?", CAMPAIGN_COLUMNS);
        let row: Option<CampaignRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(Campaign::try_from).transpose()
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let sql = format!("SELECT {} FROM campaigns ORDER BY id", CAMPAIGN_COLUMNS);
        let rows: Vec<CampaignRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        rows.into_iter().map(Campaign::try_from).collect()
    }

    /// Campaigns the scheduler should look at this tick
    pub async fn list_active_campaigns(&self) -> Result<Vec<Campaign>> {
        let sql = format!(
            "SELECT {} FROM campaigns WHERE status = 'active' ORDER BY id",
            CAMPAIGN_COLUMNS
        );
        let rows: Vec<CampaignRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        rows.into_iter().map(Campaign::try_from).collect()
    }

    /// Persist a self-tuned dial ratio
    pub async fn update_dial_ratio(&self, id: CampaignId, dial_ratio: f64) -> Result<()> {
        sqlx::query("UPDATE campaigns SET dial_ratio = ? WHERE id = ?")
            .bind(dial_ratio)
            .bind(id)
            .execute(self.pool())
            .await?;
        debug!("Campaign {} dial ratio set to {:.2}", id, dial_ratio);
        Ok(())
    }

    pub async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE campaigns SET status = ?, pause_reason = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(reason)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
