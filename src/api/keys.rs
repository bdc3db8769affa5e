//! Query keys for backend resources.

use crate::cache::QueryKey;
use crate::query_key;

use super::types::LeadFilter;

// ============================================================================
// Key prefixes
// ============================================================================

pub const TICKETS: &str = "tickets";
pub const TICKET: &str = "ticket";
pub const NOTIFICATIONS: &str = "notifications";
pub const USAGE: &str = "usage-widget";
pub const CAMPAIGN_STATS: &str = "campaigns-stats";
pub const EMAIL_CAMPAIGNS: &str = "email-campaigns";
pub const LEADS: &str = "leads-list";
pub const BATCHES: &str = "batches";
pub const USER: &str = "user";
pub const TASK_STATUS: &str = "task-status";
pub const CAMPAIGN_LOGS: &str = "email-campaign-logs";
pub const CAMPAIGN_PERFORMANCE: &str = "email-campaigns-performance";
pub const CURRENT_SUBSCRIPTION: &str = "currentSubscription";

/// Query keys for the backend's cacheable reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceKey {
  /// All support tickets
  Tickets,
  /// A single ticket with its comments
  Ticket { id: String },
  /// Latest notifications of a user
  Notifications { user_id: u64 },
  /// Usage against the subscription tier
  Usage,
  /// Aggregate campaign statistics
  CampaignStats,
  EmailCampaigns,
  /// One page of the filtered leads list
  Leads { filter: LeadFilter },
  Batches,
  /// The logged-in user
  User,
  /// Progress of a scraping task
  TaskStatus { task_id: String },
  /// Delivery log of one campaign
  CampaignLogs { id: u64 },
  /// Daily sends and responses
  CampaignPerformance,
  /// The user's plan
  CurrentSubscription,
}

impl ResourceKey {
  pub fn query_key(&self) -> QueryKey {
    match self {
      Self::Tickets => query_key![TICKETS],
      Self::Ticket { id } => query_key![TICKET, id.as_str()],
      Self::Notifications { user_id } => query_key![NOTIFICATIONS, *user_id],
      Self::Usage => query_key![USAGE],
      Self::CampaignStats => query_key![CAMPAIGN_STATS],
      Self::EmailCampaigns => query_key![EMAIL_CAMPAIGNS],
      Self::Leads { filter } => query_key![LEADS, filter.page, filter.page_size]
        .with_opt(tagged("status", &filter.status))
        .with_opt(tagged("search", &filter.search))
        .with_opt(tagged("company", &filter.company))
        .with_opt(tagged("job_title", &filter.job_title))
        .with_opt(tagged("batch_id", &filter.batch_id))
        .with(filter.unassigned),
      Self::Batches => query_key![BATCHES],
      Self::User => query_key![USER],
      Self::TaskStatus { task_id } => query_key![TASK_STATUS, task_id.as_str()],
      Self::CampaignLogs { id } => query_key![CAMPAIGN_LOGS, *id],
      Self::CampaignPerformance => query_key![CAMPAIGN_PERFORMANCE],
      Self::CurrentSubscription => query_key![CURRENT_SUBSCRIPTION],
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Tickets => "all tickets".to_string(),
      Self::Ticket { id } => format!("ticket {}", id),
      Self::Notifications { user_id } => format!("notifications for user {}", user_id),
      Self::Usage => "subscription usage".to_string(),
      Self::CampaignStats => "campaign statistics".to_string(),
      Self::EmailCampaigns => "email campaigns".to_string(),
      Self::Leads { filter } => {
        let mut desc = format!("leads page {} ({} per page)", filter.page, filter.page_size);
        if let Some(status) = &filter.status {
          desc.push_str(&format!(", status {}", status));
        }
        if let Some(search) = &filter.search {
          desc.push_str(&format!(", matching '{}'", search));
        }
        desc
      }
      Self::Batches => "lead batches".to_string(),
      Self::User => "current user".to_string(),
      Self::TaskStatus { task_id } => format!("scraping task {}", task_id),
      Self::CampaignLogs { id } => format!("logs of campaign {}", id),
      Self::CampaignPerformance => "campaign performance".to_string(),
      Self::CurrentSubscription => "current subscription".to_string(),
    }
  }
}

/// `name=value` key part for a set filter. Unset and empty filters are left
/// out, matching the query string.
fn tagged(name: &str, value: &Option<String>) -> Option<String> {
  value
    .as_deref()
    .filter(|v| !v.is_empty())
    .map(|v| format!("{}={}", name, v))
}

impl From<ResourceKey> for QueryKey {
  fn from(key: ResourceKey) -> Self {
    key.query_key()
  }
}

/// Prefix covering every cached page of the leads list.
pub fn all_leads() -> QueryKey {
  query_key![LEADS]
}

/// Prefix covering every user's notifications.
pub fn all_notifications() -> QueryKey {
  query_key![NOTIFICATIONS]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_leads_keys_share_prefix() {
    let first = ResourceKey::Leads {
      filter: LeadFilter::first_page(20),
    }
    .query_key();
    let second = ResourceKey::Leads {
      filter: LeadFilter {
        page: 1,
        page_size: 20,
        status: Some("contacted".into()),
        ..Default::default()
      },
    }
    .query_key();

    assert_ne!(first, second);
    assert!(first.starts_with(&all_leads()));
    assert!(second.starts_with(&all_leads()));
    assert!(second.starts_with(&query_key![LEADS, 1, 20]));
    assert!(!first.starts_with(&query_key![LEADS, 1]));
  }

  #[test]
  fn test_filters_with_equal_values_differ() {
    let by_status = ResourceKey::Leads {
      filter: LeadFilter {
        page_size: 20,
        status: Some("new".into()),
        ..Default::default()
      },
    }
    .query_key();
    let by_search = ResourceKey::Leads {
      filter: LeadFilter {
        page_size: 20,
        search: Some("new".into()),
        ..Default::default()
      },
    }
    .query_key();

    assert_ne!(by_status, by_search);
    assert_eq!(by_status.serialized(), r#"["leads-list",0,20,"status=new",false]"#);
    assert_eq!(by_search.serialized(), r#"["leads-list",0,20,"search=new",false]"#);
  }

  #[test]
  fn test_empty_filter_matches_unset() {
    let empty = ResourceKey::Leads {
      filter: LeadFilter {
        page_size: 20,
        company: Some(String::new()),
        ..Default::default()
      },
    };
    let unset = ResourceKey::Leads {
      filter: LeadFilter::first_page(20),
    };
    assert_eq!(empty.query_key(), unset.query_key());
  }

  #[test]
  fn test_unset_filters_are_skipped() {
    let key = ResourceKey::Leads {
      filter: LeadFilter::first_page(50),
    }
    .query_key();
    assert_eq!(key.serialized(), r#"["leads-list",0,50,false]"#);
  }

  #[test]
  fn test_ticket_key_is_string_id() {
    let key: QueryKey = ResourceKey::Ticket { id: "12".into() }.into();
    assert_eq!(key.serialized(), r#"["ticket","12"]"#);
    assert!(!key.starts_with(&query_key![TICKETS]));
  }

  #[test]
  fn test_performance_is_not_under_campaigns() {
    let performance = ResourceKey::CampaignPerformance.query_key();
    assert_eq!(performance.serialized(), r#"["email-campaigns-performance"]"#);
    assert!(!performance.starts_with(&ResourceKey::EmailCampaigns.query_key()));
    assert_eq!(
      ResourceKey::TaskStatus { task_id: "t1".into() }.query_key().serialized(),
      r#"["task-status","t1"]"#
    );
  }

  #[test]
  fn test_description() {
    assert_eq!(ResourceKey::Notifications { user_id: 3 }.description(), "notifications for user 3");
    assert_eq!(ResourceKey::Usage.description(), "subscription usage");
  }
}
