use crate::api::types::{CampaignStats, Notification, Ticket, Usage};
use crate::api::Resources;
use crate::event::{Event, EventHandler};
use crate::query::{Query, QueryState};
use color_eyre::Result;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::time::Duration;
use tracing::info;

/// Live dashboard: the queries a dashboard page keeps mounted
pub struct App {
  resources: Resources,
  usage: Query<Usage>,
  stats: Query<CampaignStats>,
  tickets: Query<Vec<Ticket>>,
  notifications: Option<Query<Vec<Notification>>>,
  should_quit: bool,
}

impl App {
  pub fn new(resources: Resources, user_id: Option<u64>) -> Self {
    Self {
      usage: resources.usage(),
      stats: resources.campaign_stats(),
      tickets: resources.tickets(),
      notifications: user_id.map(|id| resources.notifications(id)),
      resources,
      should_quit: false,
    }
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(Duration::from_millis(250)).with_stdin();
    let mut out = std::io::stdout();
    writeln!(out, "Watching dashboard. Commands: r = refetch, i = invalidate all, q = quit")?;

    while !self.should_quit {
      let Some(event) = events.next().await else {
        break;
      };
      let lines = self.handle_event(event);
      for line in lines {
        writeln!(out, "{}", line)?;
      }
      out.flush()?;
    }

    info!("Watch loop finished");
    Ok(())
  }

  /// Apply one event; returns the lines to print.
  pub fn handle_event(&mut self, event: Event) -> Vec<String> {
    match event {
      Event::Tick => self.poll_queries(),
      Event::Input(cmd) => match cmd.as_str() {
        "q" | "quit" => {
          self.should_quit = true;
          Vec::new()
        }
        "r" | "refetch" => {
          self.usage.refetch();
          self.stats.refetch();
          self.tickets.refetch();
          if let Some(n) = &self.notifications {
            n.refetch();
          }
          vec!["Refetching...".to_string()]
        }
        "i" | "invalidate" => {
          let mut keys = vec![
            self.usage.key().clone(),
            self.stats.key().clone(),
            self.tickets.key().clone(),
          ];
          if let Some(n) = &self.notifications {
            keys.push(n.key().clone());
          }
          let count = self.resources.client().invalidate_queries(&keys);
          vec![format!("Invalidated {} queries", count)]
        }
        "" => Vec::new(),
        other => vec![format!("Unknown command: {}", other)],
      },
      Event::Quit => {
        self.should_quit = true;
        Vec::new()
      }
    }
  }

  pub fn should_quit(&self) -> bool {
    self.should_quit
  }

  fn poll_queries(&mut self) -> Vec<String> {
    let mut lines = Vec::new();
    if self.usage.poll() {
      lines.push(render("usage", &self.usage, render_usage));
    }
    if self.stats.poll() {
      lines.push(render("campaigns", &self.stats, render_stats));
    }
    if self.tickets.poll() {
      lines.push(render("tickets", &self.tickets, |t| render_tickets(t)));
    }
    if let Some(n) = &mut self.notifications {
      if n.poll() {
        lines.push(render("notifications", n, |n| render_notifications(n)));
      }
    }
    lines
  }
}

/// One status line for a query, marking background refreshes.
pub fn render<T: DeserializeOwned>(label: &str, query: &Query<T>, body: impl Fn(&T) -> String) -> String {
  let refreshing = if query.is_fetching() { " (refreshing)" } else { "" };
  match query.state() {
    QueryState::Idle => format!("[{}] idle", label),
    QueryState::Loading => format!("[{}] loading...", label),
    QueryState::Success(data) => format!("[{}] {}{}", label, body(data), refreshing),
    QueryState::Error { message, previous } => match previous {
      Some(data) => format!("[{}] {} (last refresh failed: {})", label, body(data), message),
      None => format!("[{}] error: {}", label, message),
    },
  }
}

pub fn render_usage(usage: &Usage) -> String {
  let mut line = format!(
    "{} tier: {}/{} ({:.0}%), {} remaining",
    usage.tier,
    usage.current_usage,
    usage.limit,
    usage.percentage(),
    usage.remaining()
  );
  if usage.is_over_limit() {
    line.push_str(" - over limit");
  } else if usage.is_near_limit() {
    line.push_str(" - near limit");
  }
  line
}

pub fn render_stats(stats: &CampaignStats) -> String {
  format!(
    "sent {}, accepted {}, replied {}, failed {}",
    stats.sent, stats.accepted, stats.replied, stats.failed
  )
}

pub fn render_tickets(tickets: &[Ticket]) -> String {
  let open = tickets.iter().filter(|t| t.status != "closed").count();
  format!("{} tickets, {} open", tickets.len(), open)
}

pub fn render_notifications(notifications: &[Notification]) -> String {
  let unread = notifications.iter().filter(|n| !n.read).count();
  match notifications.iter().find(|n| !n.read) {
    Some(latest) => format!("{} unread, latest: {}", unread, latest.message),
    None => format!("{} notifications, all read", notifications.len()),
  }
}
