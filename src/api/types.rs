//! Domain types exchanged with the outreach backend.
//!
//! Response types are lenient (`#[serde(default)]` on optional fields) since
//! the backend omits fields freely; request types only serialize what is set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// Tickets
// ============================================================================

/// Support ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
  pub id: u64,
  #[serde(alias = "subject")]
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  pub status: String, // "open", "in_progress" or "closed"
  #[serde(default)]
  pub priority: Option<String>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub comments: Vec<TicketComment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketComment {
  #[serde(default)]
  pub author: Option<String>,
  pub content: String,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewTicket {
  pub subject: String,
  pub description: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TicketUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub id: u64,
  pub user_id: u64,
  #[serde(rename = "type")]
  pub kind: String,
  pub message: String,
  pub read: bool,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub priority: Option<String>,
  #[serde(default)]
  pub expires_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub metadata: Option<String>,
  #[serde(default)]
  pub delivery_status: Option<String>,
}

// ============================================================================
// Leads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
  pub id: String,
  pub first_name: String,
  pub last_name: String,
  #[serde(default)]
  pub job_title: String,
  #[serde(default)]
  pub company: String,
  #[serde(default)]
  pub profile_url: String,
  pub status: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub email_confidence: Option<f64>,
  #[serde(default)]
  pub email_verification_status: Option<String>,
  #[serde(default)]
  pub campaign_id: Option<String>,
}

impl Lead {
  pub fn full_name(&self) -> String {
    format!("{} {}", self.first_name, self.last_name)
      .trim()
      .to_string()
  }
}

/// One page of the leads list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeadsPage {
  #[serde(default)]
  pub leads: Vec<Lead>,
  /// Total matching leads; falls back to the page length when absent
  #[serde(default)]
  pub total: Option<u64>,
}

impl LeadsPage {
  pub fn total(&self) -> u64 {
    self.total.unwrap_or(self.leads.len() as u64)
  }
}

/// Filters for the leads list. Every field narrows the query key too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadFilter {
  pub page: u32,
  pub page_size: u32,
  pub status: Option<String>,
  pub search: Option<String>,
  pub company: Option<String>,
  pub job_title: Option<String>,
  pub batch_id: Option<String>,
  pub unassigned: bool,
}

impl LeadFilter {
  pub fn first_page(page_size: u32) -> Self {
    Self {
      page_size,
      ..Default::default()
    }
  }

  /// Index of the first lead on this page.
  pub fn offset(&self) -> u64 {
    u64::from(self.page) * u64::from(self.page_size)
  }

  /// Query-string parameters for the list endpoint.
  pub fn query_params(&self) -> Vec<(&'static str, String)> {
    let mut params = vec![
      ("offset", self.offset().to_string()),
      ("limit", self.page_size.to_string()),
    ];
    if self.unassigned {
      params.push(("unassigned", "true".to_string()));
    }
    let optional = [
      ("status", &self.status),
      ("search", &self.search),
      ("company", &self.company),
      ("job_title", &self.job_title),
      ("batch_id", &self.batch_id),
    ];
    for (name, value) in optional {
      if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
        params.push((name, v.to_string()));
      }
    }
    params
  }
}

/// Server acknowledgement for bulk lead operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
  #[serde(default)]
  pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadBatch {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadBatches {
  #[serde(default)]
  pub batches: Vec<LeadBatch>,
}

// ============================================================================
// Scraping tasks
// ============================================================================

/// Progress of a background scraping task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
  pub status: String, // "pending", "done", "error" or "cancelled"
  #[serde(default)]
  pub result: Option<TaskResult>,
  #[serde(default)]
  pub step: Option<String>,
  #[serde(default)]
  pub progress: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
  #[serde(default)]
  pub scraped: Vec<Value>,
  #[serde(default)]
  pub enriched: Vec<Value>,
  #[serde(default)]
  pub failed: Vec<Value>,
  #[serde(default)]
  pub step: Option<String>,
  #[serde(default)]
  pub progress: Option<f64>,
}

impl TaskStatus {
  pub fn is_pending(&self) -> bool {
    self.status == "pending"
  }

  pub fn is_done(&self) -> bool {
    self.status == "done"
  }

  /// The task will not change any more.
  pub fn is_finished(&self) -> bool {
    !self.is_pending()
  }

  /// Current step, preferring the one reported inside the result.
  pub fn step(&self) -> Option<&str> {
    self
      .result
      .as_ref()
      .and_then(|r| r.step.as_deref())
      .or(self.step.as_deref())
  }

  pub fn progress(&self) -> Option<f64> {
    self
      .result
      .as_ref()
      .and_then(|r| r.progress)
      .or(self.progress)
  }
}

// ============================================================================
// Email campaigns
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailCampaign {
  pub id: u64,
  pub name: String,
  #[serde(default)]
  pub subject: String,
  #[serde(default)]
  pub body: String,
  #[serde(default = "default_campaign_status")]
  pub status: String, // "draft", "active", "paused" or "completed"
  #[serde(default)]
  pub follow_ups: Vec<FollowUp>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

fn default_campaign_status() -> String {
  "draft".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
  pub subject: String,
  pub body: String,
  pub delay_days: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCampaign {
  pub name: String,
  pub subject: String,
  pub body: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub follow_ups: Vec<FollowUp>,
}

/// Aggregate send statistics across campaigns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
  #[serde(default)]
  pub sent: u64,
  #[serde(default)]
  pub accepted: u64,
  #[serde(default)]
  pub replied: u64,
  #[serde(default)]
  pub failed: u64,
}

/// Pacing for a campaign send. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendConfig {
  pub batch_size: u32,
  pub min_delay: u32,
  pub max_delay: u32,
  pub batch_delay: u32,
}

impl Default for SendConfig {
  fn default() -> Self {
    Self {
      batch_size: 10,
      min_delay: 5,
      max_delay: 30,
      batch_delay: 300,
    }
  }
}

/// Template values for one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Personalization {
  pub first_name: String,
  pub company: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCampaign {
  pub lead_ids: Vec<String>,
  pub personalization: BTreeMap<String, Personalization>,
  #[serde(flatten)]
  pub config: SendConfig,
}

impl SendCampaign {
  /// Send to every lead that has an email address.
  pub fn to_leads(leads: &[Lead], config: SendConfig) -> Self {
    let recipients: Vec<&Lead> = leads.iter().filter(|l| l.email.is_some()).collect();
    Self {
      lead_ids: recipients.iter().map(|l| l.id.clone()).collect(),
      personalization: recipients
        .iter()
        .map(|l| {
          let values = Personalization {
            first_name: l.first_name.clone(),
            company: l.company.clone(),
          };
          (l.id.clone(), values)
        })
        .collect(),
      config,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
  #[serde(default)]
  pub sent: u64,
  #[serde(default)]
  pub failed: u64,
}

/// Delivery record of one campaign email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignLog {
  #[serde(default)]
  pub lead_name: Option<String>,
  pub to_email: String,
  pub status: String,
  #[serde(default)]
  pub sent_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub opened_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub clicked_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub message_id: Option<String>,
  #[serde(default)]
  pub error: Option<String>,
}

/// Sends and responses on one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePoint {
  pub date: String,
  #[serde(default)]
  pub sent: u64,
  #[serde(default)]
  pub responses: u64,
}

// ============================================================================
// Subscription usage
// ============================================================================

/// The user's plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
  pub tier: String,
  #[serde(default)]
  pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
  pub tier: String,
  pub current_usage: u64,
  pub limit: u64,
  #[serde(default)]
  pub remaining: Option<u64>,
}

impl Usage {
  pub fn remaining(&self) -> u64 {
    self
      .remaining
      .unwrap_or_else(|| self.limit.saturating_sub(self.current_usage))
  }

  pub fn is_over_limit(&self) -> bool {
    self.current_usage > self.limit
  }

  /// At or above 80% of the tier limit.
  pub fn is_near_limit(&self) -> bool {
    self.current_usage * 5 >= self.limit * 4
  }

  pub fn percentage(&self) -> f64 {
    if self.limit == 0 {
      return 100.0;
    }
    (self.current_usage as f64 / self.limit as f64 * 100.0).min(100.0)
  }
}

// ============================================================================
// Users and auth
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub username: Option<String>,
  #[serde(default)]
  pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
  pub username: String,
  pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
  #[serde(default)]
  pub access_token: Option<String>,
}
