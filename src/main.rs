use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use leadsync::api::types::{LeadFilter, LoginRequest, NewTicket, SendCampaign, SendConfig};
use leadsync::api::{ApiClient, Resources};
use leadsync::app::{self, App};
use leadsync::cache::{CacheStorage, NoopStorage, QueryClient, SqliteStorage};
use leadsync::config::Config;
use leadsync::logging;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "leadsync")]
#[command(about = "Cached command-line client for the lead outreach dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/leadsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Do not read or write cache snapshots
  #[arg(long)]
  no_cache: bool,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List support tickets
  Tickets,
  /// Show one ticket with its comments
  Ticket { id: String },
  /// Open a support ticket
  CreateTicket {
    subject: String,
    description: String,
    #[arg(long)]
    priority: Option<String>,
  },
  /// Comment on a ticket
  Comment { id: u64, content: String },
  /// List recent notifications
  Notifications,
  /// Mark one notification as read
  MarkRead { id: u64 },
  /// Mark every notification as read
  MarkAllRead,
  /// Show usage against the subscription tier
  Usage,
  /// List leads
  Leads {
    #[arg(long, default_value_t = 0)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    per_page: u32,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    search: Option<String>,
  },
  /// Follow a scraping task until it finishes
  Task { id: String },
  /// Cancel a running scraping task
  CancelTask { id: String },
  /// List email campaigns and aggregate stats
  Campaigns,
  /// Send a campaign to the leads of a batch
  SendCampaign {
    id: u64,
    #[arg(long)]
    batch_id: String,
    #[arg(long, default_value_t = 10)]
    batch_size: u32,
    /// Seconds between emails, lower bound
    #[arg(long, default_value_t = 5)]
    min_delay: u32,
    #[arg(long, default_value_t = 30)]
    max_delay: u32,
    /// Seconds between batches
    #[arg(long, default_value_t = 300)]
    batch_delay: u32,
  },
  /// Show the delivery log of a campaign
  CampaignLogs { id: u64 },
  /// Show the current subscription plan
  Subscription,
  /// Log in (password from LEADSYNC_PASSWORD)
  Login { username: String },
  /// Forget the stored access token
  Logout,
  /// Keep the dashboard queries mounted and print changes
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = match Config::data_dir() {
    Some(dir) => Some(logging::init(&dir.join("logs"), args.verbose)?),
    None => {
      logging::init_stderr(args.verbose)?;
      None
    }
  };

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let storage: Arc<dyn CacheStorage> = if config.cache.persist && !args.no_cache {
    Arc::new(SqliteStorage::open()?)
  } else {
    Arc::new(NoopStorage)
  };
  let client = QueryClient::with_storage(storage, config.cache.query_options());
  let resources = Resources::new(ApiClient::new(&config)?, client);

  run(args.command, &resources, config.user_id).await
}

async fn run(command: Command, resources: &Resources, user_id: Option<u64>) -> Result<()> {
  match command {
    Command::Tickets => {
      for ticket in resources.tickets().into_result().await? {
        println!("#{:<5} {:<12} {}", ticket.id, ticket.status, ticket.title);
      }
    }
    Command::Ticket { id } => {
      let ticket = resources.ticket(&id).into_result().await?;
      println!("#{} {} [{}]", ticket.id, ticket.title, ticket.status);
      if let Some(description) = &ticket.description {
        println!("\n{}\n", description);
      }
      for comment in &ticket.comments {
        println!(
          "- {}: {}",
          comment.author.as_deref().unwrap_or("unknown"),
          comment.content
        );
      }
    }
    Command::CreateTicket {
      subject,
      description,
      priority,
    } => {
      let ticket = resources
        .create_ticket()
        .mutate(NewTicket {
          subject,
          description,
          priority,
        })
        .await?;
      println!("Created ticket #{}", ticket.id);
    }
    Command::Comment { id, content } => {
      resources.add_comment().mutate((id, content)).await?;
      println!("Comment added to #{}", id);
    }
    Command::Notifications => {
      let user_id = user_id.ok_or_else(|| eyre!("Set user_id in the config to list notifications"))?;
      let notifications = resources.notifications(user_id).into_result().await?;
      println!("{}", app::render_notifications(&notifications));
      for n in notifications {
        let marker = if n.read { ' ' } else { '*' };
        println!("{} {:<5} {} {}", marker, n.id, n.created_at.format("%Y-%m-%d %H:%M"), n.message);
      }
    }
    Command::MarkRead { id } => {
      resources.mark_notification_read().mutate(id).await?;
      println!("Marked {} as read", id);
    }
    Command::MarkAllRead => {
      resources.mark_all_notifications_read().mutate(()).await?;
      println!("All notifications marked as read");
    }
    Command::Usage => {
      let usage = resources.usage().into_result().await?;
      println!("{}", app::render_usage(&usage));
    }
    Command::Leads {
      page,
      per_page,
      status,
      search,
    } => {
      let filter = LeadFilter {
        page,
        page_size: per_page,
        status,
        search,
        ..Default::default()
      };
      let leads = resources.leads(filter).into_result().await?;
      println!("{} leads (page {})", leads.total(), page);
      for lead in &leads.leads {
        println!(
          "{:<24} {:<24} {:<12} {}",
          lead.full_name(),
          lead.company,
          lead.status,
          lead.email.as_deref().unwrap_or("-")
        );
      }
    }
    Command::Task { id } => {
      let status = resources.wait_for_task(&id).await?;
      println!("Task {} {}", id, status.status);
      if let Some(result) = &status.result {
        println!(
          "scraped {}, enriched {}, failed {}",
          result.scraped.len(),
          result.enriched.len(),
          result.failed.len()
        );
      }
    }
    Command::CancelTask { id } => {
      let result = resources.cancel_task().mutate(id.clone()).await?;
      println!("{}", result.message.unwrap_or_else(|| format!("Task {} cancelled", id)));
    }
    Command::Campaigns => {
      let stats = resources.campaign_stats();
      let performance = resources.campaign_performance();
      let campaigns = resources.email_campaigns().into_result().await?;
      for campaign in &campaigns {
        println!("{:<5} {:<10} {}", campaign.id, campaign.status, campaign.name);
      }
      println!("{}", app::render_stats(&stats.into_result().await?));
      for point in performance.into_result().await? {
        println!("{}  sent {:<5} responses {}", point.date, point.sent, point.responses);
      }
    }
    Command::SendCampaign {
      id,
      batch_id,
      batch_size,
      min_delay,
      max_delay,
      batch_delay,
    } => {
      let filter = LeadFilter {
        page_size: 1000,
        batch_id: Some(batch_id.clone()),
        ..Default::default()
      };
      let leads = resources.leads(filter).into_result().await?;
      let config = SendConfig {
        batch_size,
        min_delay,
        max_delay,
        batch_delay,
      };
      let request = SendCampaign::to_leads(&leads.leads, config);
      if request.lead_ids.is_empty() {
        return Err(eyre!("No lead in batch {} has an email address", batch_id));
      }
      let result = resources.send_campaign().mutate((id, request)).await?;
      println!("Sent {}, failed {}", result.sent, result.failed);
    }
    Command::CampaignLogs { id } => {
      for log in resources.campaign_logs(id).into_result().await? {
        let sent = log
          .sent_at
          .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
          .unwrap_or_else(|| "-".to_string());
        println!(
          "{:<16} {:<10} {:<32} {}",
          sent,
          log.status,
          log.to_email,
          log.error.as_deref().unwrap_or("")
        );
      }
    }
    Command::Subscription => {
      let subscription = resources.current_subscription().into_result().await?;
      println!(
        "{} ({})",
        subscription.tier,
        subscription.status.as_deref().unwrap_or("unknown")
      );
    }
    Command::Login { username } => {
      let password = Config::get_password()?;
      let logged_in = resources
        .login()
        .mutate(LoginRequest { username, password })
        .await?;
      if !logged_in {
        return Err(eyre!("Login succeeded but no access token was returned"));
      }
      match resources.current_user().into_result().await? {
        Some(user) => println!(
          "Logged in as {}",
          user.username.or(user.email).unwrap_or_else(|| user.id.to_string())
        ),
        None => println!("Logged in"),
      }
    }
    Command::Logout => {
      resources.logout()?;
      println!("Logged out");
    }
    Command::Watch => {
      let mut app = App::new(resources.clone(), user_id);
      app.run().await?;
    }
  }

  Ok(())
}
