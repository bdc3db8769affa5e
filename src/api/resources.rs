//! Typed resource hooks that wrap ApiClient with the query cache.

use std::time::Duration;

use color_eyre::Result;
use tracing::debug;

use crate::cache::{Mutation, QueryClient, QueryError, QueryKey, QueryOptions, QueryResult};
use crate::query::Query;

use super::client::ApiClient;
use super::keys::{self, ResourceKey};
use super::types::{
  BulkResult, CampaignLog, CampaignStats, EmailCampaign, LeadBatches, LeadFilter, LeadsPage,
  LoginRequest, NewCampaign, NewTicket, Notification, PerformancePoint, SendCampaign, SendResult,
  Subscription, TaskStatus, Ticket, TicketUpdate, Usage, User,
};

/// Notifications are polled while someone watches them
pub const NOTIFICATIONS_POLL: Duration = Duration::from_secs(30);
/// The usage widget polls faster so quota changes show up quickly
pub const USAGE_POLL: Duration = Duration::from_secs(10);
pub const CAMPAIGN_STATS_STALE: Duration = Duration::from_secs(60);
pub const CAMPAIGN_PERFORMANCE_STALE: Duration = Duration::from_secs(5 * 60);
/// Pending scraping tasks are checked this often
pub const TASK_POLL: Duration = Duration::from_secs(2);
const SUBSCRIPTION_RETRIES: u32 = 2;

/// Backend resources with transparent caching, de-duplication and
/// invalidation.
///
/// Reads return live [`Query`] handles; writes return [`Mutation`]s that
/// invalidate the reads they affect.
#[derive(Clone, Debug)]
pub struct Resources {
  api: ApiClient,
  client: QueryClient,
}

/// Build a fetcher closure over a clone of the API client.
macro_rules! fetcher {
  ($api:expr, |$a:ident| $call:expr) => {{
    let api = $api.clone();
    move || {
      let $a = api.clone();
      async move { $call.await }
    }
  }};
}

impl Resources {
  pub fn new(api: ApiClient, client: QueryClient) -> Self {
    Self { api, client }
  }

  pub fn api(&self) -> &ApiClient {
    &self.api
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  fn options(&self) -> QueryOptions {
    self.client.default_options()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub fn tickets(&self) -> Query<Vec<Ticket>> {
    Query::new(
      &self.client,
      ResourceKey::Tickets.query_key(),
      fetcher!(self.api, |api| api.tickets()),
      self.options(),
    )
  }

  /// A single ticket. Disabled until an id is known.
  pub fn ticket(&self, id: &str) -> Query<Ticket> {
    let key = ResourceKey::Ticket { id: id.to_string() };
    let api = self.api.clone();
    let raw_id = id.to_string();
    Query::new(
      &self.client,
      key.query_key(),
      move || {
        let api = api.clone();
        let parsed = raw_id.parse::<u64>();
        let raw_id = raw_id.clone();
        async move {
          let id = parsed.map_err(|_| QueryError::InvalidKey(format!("ticket id {}", raw_id)))?;
          api.ticket(id).await
        }
      },
      self.options().enabled(!id.is_empty()),
    )
  }

  /// Notifications of `user_id`, polled every 30 seconds. User id 0 means
  /// nobody is logged in and keeps the query disabled.
  pub fn notifications(&self, user_id: u64) -> Query<Vec<Notification>> {
    Query::new(
      &self.client,
      ResourceKey::Notifications { user_id }.query_key(),
      fetcher!(self.api, |api| api.notifications()),
      self
        .options()
        .with_refetch_interval(NOTIFICATIONS_POLL)
        .enabled(user_id != 0),
    )
  }

  /// Usage against the subscription tier, polled every 10 seconds.
  pub fn usage(&self) -> Query<Usage> {
    Query::new(
      &self.client,
      ResourceKey::Usage.query_key(),
      fetcher!(self.api, |api| api.usage()),
      self.options().with_refetch_interval(USAGE_POLL),
    )
  }

  pub fn campaign_stats(&self) -> Query<CampaignStats> {
    Query::new(
      &self.client,
      ResourceKey::CampaignStats.query_key(),
      fetcher!(self.api, |api| api.campaign_stats()),
      self.options().with_stale_time(CAMPAIGN_STATS_STALE),
    )
  }

  pub fn campaign_performance(&self) -> Query<Vec<PerformancePoint>> {
    Query::new(
      &self.client,
      ResourceKey::CampaignPerformance.query_key(),
      fetcher!(self.api, |api| api.campaign_performance()),
      self.options().with_stale_time(CAMPAIGN_PERFORMANCE_STALE),
    )
  }

  pub fn campaign_logs(&self, id: u64) -> Query<Vec<CampaignLog>> {
    let api = self.api.clone();
    Query::new(
      &self.client,
      ResourceKey::CampaignLogs { id }.query_key(),
      move || {
        let api = api.clone();
        async move { api.campaign_logs(id).await }
      },
      self.options(),
    )
  }

  pub fn email_campaigns(&self) -> Query<Vec<EmailCampaign>> {
    Query::new(
      &self.client,
      ResourceKey::EmailCampaigns.query_key(),
      fetcher!(self.api, |api| api.email_campaigns()),
      self.options(),
    )
  }

  pub fn leads(&self, filter: LeadFilter) -> Query<LeadsPage> {
    let key = ResourceKey::Leads {
      filter: filter.clone(),
    };
    let api = self.api.clone();
    Query::new(
      &self.client,
      key.query_key(),
      move || {
        let api = api.clone();
        let filter = filter.clone();
        async move { api.leads(&filter).await }
      },
      self.options(),
    )
  }

  pub fn batches(&self) -> Query<LeadBatches> {
    Query::new(
      &self.client,
      ResourceKey::Batches.query_key(),
      fetcher!(self.api, |api| api.lead_batches()),
      self.options(),
    )
  }

  /// Progress of a scraping task, polled every 2 seconds while watched.
  pub fn task_status(&self, task_id: &str) -> Query<TaskStatus> {
    let api = self.api.clone();
    let id = task_id.to_string();
    Query::new(
      &self.client,
      ResourceKey::TaskStatus {
        task_id: task_id.to_string(),
      }
      .query_key(),
      move || {
        let api = api.clone();
        let id = id.clone();
        async move { api.task_status(&id).await }
      },
      self
        .options()
        .with_refetch_interval(TASK_POLL)
        .enabled(!task_id.is_empty()),
    )
  }

  /// Poll a scraping task until it is no longer pending.
  pub async fn wait_for_task(&self, task_id: &str) -> QueryResult<TaskStatus> {
    if task_id.is_empty() {
      return Err(QueryError::Disabled);
    }
    follow_task(&self.client, self.task_status(task_id)).await
  }

  pub fn current_subscription(&self) -> Query<Subscription> {
    Query::new(
      &self.client,
      ResourceKey::CurrentSubscription.query_key(),
      fetcher!(self.api, |api| api.current_subscription()),
      self.options().with_retry_count(SUBSCRIPTION_RETRIES),
    )
  }

  /// The logged-in user; `None` when the token is missing or rejected.
  pub fn current_user(&self) -> Query<Option<User>> {
    Query::new(
      &self.client,
      ResourceKey::User.query_key(),
      fetcher!(self.api, |api| api.current_user()),
      self.options(),
    )
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  pub fn create_ticket(&self) -> Mutation<NewTicket, Ticket> {
    let api = self.api.clone();
    self.client.mutation(
      move |ticket: NewTicket| {
        let api = api.clone();
        async move { api.create_ticket(&ticket).await }
      },
      [ResourceKey::Tickets.query_key()],
    )
  }

  pub fn update_ticket(&self) -> Mutation<(u64, TicketUpdate), Ticket> {
    let api = self.api.clone();
    self.client.mutation(
      move |(id, update): (u64, TicketUpdate)| {
        let api = api.clone();
        async move { api.update_ticket(id, &update).await }
      },
      [ticket_prefix(), ResourceKey::Tickets.query_key()],
    )
  }

  pub fn delete_ticket(&self) -> Mutation<u64, ()> {
    let api = self.api.clone();
    self.client.mutation(
      move |id: u64| {
        let api = api.clone();
        async move { api.delete_ticket(id).await }
      },
      [ResourceKey::Tickets.query_key()],
    )
  }

  pub fn add_comment(&self) -> Mutation<(u64, String), ()> {
    let api = self.api.clone();
    self.client.mutation(
      move |(id, content): (u64, String)| {
        let api = api.clone();
        async move { api.add_comment(id, &content).await }
      },
      [ticket_prefix(), ResourceKey::Tickets.query_key()],
    )
  }

  pub fn mark_notification_read(&self) -> Mutation<u64, ()> {
    let api = self.api.clone();
    self.client.mutation(
      move |id: u64| {
        let api = api.clone();
        async move { api.mark_notification_read(id).await }
      },
      [keys::all_notifications()],
    )
  }

  pub fn mark_all_notifications_read(&self) -> Mutation<(), ()> {
    let api = self.api.clone();
    self.client.mutation(
      move |_: ()| {
        let api = api.clone();
        async move { api.mark_all_notifications_read().await }
      },
      [keys::all_notifications()],
    )
  }

  pub fn create_campaign(&self) -> Mutation<NewCampaign, EmailCampaign> {
    let api = self.api.clone();
    self.client.mutation(
      move |campaign: NewCampaign| {
        let api = api.clone();
        async move { api.create_campaign(&campaign).await }
      },
      [
        ResourceKey::EmailCampaigns.query_key(),
        ResourceKey::CampaignStats.query_key(),
      ],
    )
  }

  /// Send a campaign to the given leads in paced batches.
  pub fn send_campaign(&self) -> Mutation<(u64, SendCampaign), SendResult> {
    let api = self.api.clone();
    self.client.mutation(
      move |(id, request): (u64, SendCampaign)| {
        let api = api.clone();
        async move { api.send_campaign(id, &request).await }
      },
      [
        ResourceKey::EmailCampaigns.query_key(),
        ResourceKey::CampaignStats.query_key(),
        crate::query_key![keys::CAMPAIGN_LOGS],
      ],
    )
  }

  pub fn set_campaign_status(&self) -> Mutation<(u64, String), EmailCampaign> {
    let api = self.api.clone();
    self.client.mutation(
      move |(id, status): (u64, String)| {
        let api = api.clone();
        async move { api.set_campaign_status(id, &status).await }
      },
      [ResourceKey::EmailCampaigns.query_key()],
    )
  }

  pub fn delete_campaign(&self) -> Mutation<u64, ()> {
    let api = self.api.clone();
    self.client.mutation(
      move |id: u64| {
        let api = api.clone();
        async move { api.delete_campaign(id).await }
      },
      [ResourceKey::EmailCampaigns.query_key()],
    )
  }

  pub fn delete_batch(&self) -> Mutation<String, ()> {
    let api = self.api.clone();
    self.client.mutation(
      move |id: String| {
        let api = api.clone();
        async move { api.delete_batch(&id).await }
      },
      [ResourceKey::Batches.query_key(), keys::all_leads()],
    )
  }

  pub fn bulk_update_leads(&self) -> Mutation<(Vec<String>, String), BulkResult> {
    let api = self.api.clone();
    self.client.mutation(
      move |(ids, status): (Vec<String>, String)| {
        let api = api.clone();
        async move { api.bulk_update_leads(&ids, &status).await }
      },
      [keys::all_leads()],
    )
  }

  pub fn bulk_delete_leads(&self) -> Mutation<Vec<String>, BulkResult> {
    let api = self.api.clone();
    self.client.mutation(
      move |ids: Vec<String>| {
        let api = api.clone();
        async move { api.bulk_delete_leads(&ids).await }
      },
      [
        keys::all_leads(),
        ResourceKey::Batches.query_key(),
        ResourceKey::Usage.query_key(),
      ],
    )
  }

  pub fn cancel_task(&self) -> Mutation<String, BulkResult> {
    let api = self.api.clone();
    self.client.mutation(
      move |task_id: String| {
        let api = api.clone();
        async move { api.cancel_task(&task_id).await }
      },
      [crate::query_key![keys::TASK_STATUS]],
    )
  }

  /// Log in and refresh everything that depends on the user.
  pub fn login(&self) -> Mutation<LoginRequest, bool> {
    let api = self.api.clone();
    self.client.mutation(
      move |credentials: LoginRequest| {
        let api = api.clone();
        async move { api.login(&credentials).await }
      },
      [ResourceKey::User.query_key()],
    )
  }

  /// Drop the token and every cached trace of the user.
  pub fn logout(&self) -> Result<()> {
    self.api.logout()?;
    let key = ResourceKey::User.query_key();
    let removed = self.client.remove_queries(&key);
    if self.client.get_entry(&key).is_some() {
      // Still on screen: show the logged-out state instead
      self
        .client
        .set_query_data(&key, &Option::<User>::None)
        .map_err(|e| color_eyre::eyre::eyre!("Failed to reset user: {}", e))?;
    }
    debug!(removed, "Logged out");
    Ok(())
  }
}

/// Wait on a task-status query until the task finishes. Failed polls are
/// skipped and the next tick tries again. A finished "done" task refreshes
/// every leads page.
pub async fn follow_task(client: &QueryClient, mut query: Query<TaskStatus>) -> QueryResult<TaskStatus> {
  loop {
    if let Some(status) = query.data().filter(|s| s.is_finished()).cloned() {
      if status.is_done() {
        let refreshed = client.invalidate(&keys::all_leads());
        debug!(key = %query.key(), refreshed, "Task done");
      }
      return Ok(status);
    }
    if !query.changed().await {
      return Err(QueryError::Cancelled(query.key().to_string()));
    }
  }
}

fn ticket_prefix() -> QueryKey {
  crate::query_key![keys::TICKET]
}
