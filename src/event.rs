use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Watch loop events
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
  /// A line typed on stdin
  Input(String),
  /// Periodic tick for query polling
  Tick,
  /// Ctrl-C or end of input
  Quit,
}

/// Event handler that produces events from stdin, Ctrl-C and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn tick timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    let signal_tx = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = signal_tx.send(Event::Quit);
      }
    });

    Self { tx, rx }
  }

  /// Also read commands from stdin, one per line.
  pub fn with_stdin(self) -> Self {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(Event::Input(line.trim().to_string())).is_err() {
          return;
        }
      }
      let _ = tx.send(Event::Quit);
    });
    self
  }

  /// Sender for injecting events
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_ticks_and_injected_events() {
    let mut events = EventHandler::new(Duration::from_millis(250));
    assert_eq!(events.next().await, Some(Event::Tick));

    events.sender().send(Event::Input("r".into())).unwrap();
    assert_eq!(events.next().await, Some(Event::Input("r".into())));
    assert_eq!(events.next().await, Some(Event::Tick));
  }
}
