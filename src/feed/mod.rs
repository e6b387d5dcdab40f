//! The live feed: transport events in, graph and log out.
//!
//! A [`LiveFeed`] owns the graph store and the raw log and is the only thing
//! that mutates them. Run it on its own task with [`LiveFeed::run`]; talk to
//! it through a [`FeedHandle`].
//!
//! Every inbound frame goes through the same gate:
//!
//! ```text
//! frame -> decode -> fingerprint -> dedup (stream window) -> classify
//!                                      |                       |
//!                                  suppressed          Event: log + graph
//!                                                      Opaque: log only
//! ```

mod log;

pub use log::{DEFAULT_LOG_CAPACITY, LogEntry, LogKind, RawLog};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::dedup::{DedupCache, fingerprint};
use crate::error::TransportError;
use crate::events::{Classified, Event, InboundFrame, OutboundMessage, classify};
use crate::graph::{GraphReader, GraphSnapshot, GraphStore, Pulse};
use crate::history::{Backfill, BackfillOrigin};
use crate::settings::{ReconnectSettings, Settings};
use crate::transport::{ConnectOutcome, ConnectionState, Connector, Endpoint, TransportEvent};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A valid event; the graph changed.
    Applied,
    /// Not an event; shown in the log only.
    Logged,
    /// Seen within the window; nothing happened.
    Suppressed,
}

/// Result of seeding the feed from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub origin: BackfillOrigin,
    /// Events applied to the graph.
    pub applied: usize,
}

/// Exponential backoff for reconnecting after a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// The configured policy, or `None` when reconnecting is off.
    pub fn from_settings(settings: &ReconnectSettings) -> Option<Self> {
        settings.enabled.then(|| Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.initial_delay_ms)),
            max_attempts: settings.max_attempts,
        })
    }

    /// Delay before retry number `attempt` (0-based): doubles each time, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another retry is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

enum Command {
    CancelReconnect,
    Stop,
}

/// Cloneable access to a running [`LiveFeed`].
#[derive(Clone)]
pub struct FeedHandle {
    graph: GraphReader,
    log: watch::Receiver<Arc<[LogEntry]>>,
    connector: Connector,
    endpoint: Endpoint,
    commands: mpsc::UnboundedSender<Command>,
}

impl FeedHandle {
    /// The latest graph snapshot.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// Subscribe to graph snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<GraphSnapshot> {
        self.graph.subscribe()
    }

    /// Subscribe to interaction pulses.
    pub fn pulses(&self) -> broadcast::Receiver<Pulse> {
        self.graph.pulses()
    }

    /// The latest raw log entries, oldest first.
    pub fn log(&self) -> Arc<[LogEntry]> {
        self.log.borrow().clone()
    }

    pub fn subscribe_log(&self) -> watch::Receiver<Arc<[LogEntry]>> {
        self.log.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connector.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connector.watch_state()
    }

    /// Connect to the configured endpoint.
    pub async fn connect(&self) -> Result<ConnectOutcome, TransportError> {
        self.connector.connect(&self.endpoint).await
    }

    /// Disconnect and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::CancelReconnect);
        self.connector.disconnect().await;
    }

    /// Send a chat line. Returns `false` unless connected.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        self.connector.send(message)
    }

    /// Ask the feed task to disconnect and exit.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

/// Owner of the graph and log for one stream.
pub struct LiveFeed {
    cache: Arc<DedupCache>,
    graph: GraphStore,
    log: RawLog,
    connector: Connector,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    endpoint: Endpoint,
    stream_window: Duration,
    system_window: Duration,
    reconnect: Option<ReconnectPolicy>,
    reconnect_attempts: u32,
    retry_at: Option<Instant>,
    attempt: Option<JoinHandle<()>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl LiveFeed {
    /// Build a disconnected feed. The dedup cache is shared with whoever else
    /// holds it, typically every feed built during the process lifetime.
    pub fn new(settings: &Settings, cache: Arc<DedupCache>) -> Self {
        let (connector, transport_events) = Connector::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Self {
            cache,
            graph: GraphStore::new(settings.graph.unknown_label.clone()),
            log: RawLog::new(settings.log.capacity),
            connector,
            transport_events,
            endpoint: settings.endpoint(),
            stream_window: settings.dedup.stream_window(),
            system_window: settings.dedup.system_window(),
            reconnect: ReconnectPolicy::from_settings(&settings.transport.reconnect),
            reconnect_attempts: 0,
            retry_at: None,
            attempt: None,
            commands_tx,
            commands_rx,
        }
    }

    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            graph: self.graph.reader(),
            log: self.log.subscribe(),
            connector: self.connector.clone(),
            endpoint: self.endpoint.clone(),
            commands: self.commands_tx.clone(),
        }
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn log(&self) -> &RawLog {
        &self.log
    }

    /// Push one inbound frame through dedup, classification and the graph.
    pub fn ingest(&mut self, frame: InboundFrame) -> IngestOutcome {
        let value = frame.decode();
        let key = fingerprint(&value);

        if self.cache.should_ignore(&key, self.stream_window) {
            debug!(fingerprint = %key, "Suppressed duplicate frame");
            return IngestOutcome::Suppressed;
        }

        match classify(value.clone()) {
            Classified::Event(event) => {
                self.log.push(LogKind::Event, event.summary(), Some(value));
                let outcome = self.graph.apply_event(&event);
                debug!(
                    event_type = %event.event_type,
                    source = %event.source_agent.id,
                    new_agents = outcome.new_agents,
                    new_links = outcome.new_links,
                    pulses = outcome.pulses,
                    "Applied event"
                );
                IngestOutcome::Applied
            }
            Classified::Opaque(value) => {
                let (text, payload) = match value {
                    Value::String(text) => (text, None),
                    other => (other.to_string(), Some(other)),
                };
                debug!(len = text.len(), "Logged opaque frame");
                self.log.push(LogKind::Opaque, text, payload);
                IngestOutcome::Logged
            }
        }
    }

    /// Seed the graph from history without emitting pulses.
    ///
    /// Every admitted fingerprint is recorded so the server's replay of the
    /// same events after connecting is suppressed.
    pub fn seed(&mut self, raw: Vec<Value>) -> usize {
        let mut events: Vec<(Event, Value)> = Vec::new();
        for value in raw {
            let key = fingerprint(&value);
            if self.cache.should_ignore(&key, self.stream_window) {
                continue;
            }
            if let Classified::Event(event) = classify(value.clone()) {
                events.push((event, value));
            }
        }

        // Oldest first; unparseable timestamps sort to the front.
        events.sort_by_key(|(event, _)| event.parsed_timestamp());

        self.log.extend(
            events
                .iter()
                .map(|(event, value)| (LogKind::Event, event.summary(), Some(value.clone()))),
        );
        self.graph.seed(events.iter().map(|(event, _)| event))
    }

    /// Load history and seed the graph with it.
    pub async fn backfill(&mut self, backfill: &Backfill) -> BackfillReport {
        let loaded = backfill.load().await;
        let applied = self.seed(loaded.events);
        info!(origin = %loaded.origin, applied, "History backfill complete");
        BackfillReport {
            origin: loaded.origin,
            applied,
        }
    }

    /// Process transport events and handle commands until stopped.
    ///
    /// Disconnects on the way out.
    pub async fn run(mut self) {
        loop {
            let retry = sleep_until(self.retry_at.unwrap_or_else(Instant::now));

            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(Command::CancelReconnect) => {
                        self.cancel_reconnect();
                        if self.abort_attempt().await {
                            self.connector.disconnect().await;
                        }
                    }
                    Some(Command::Stop) | None => break,
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.on_transport(event),
                    None => break,
                },
                _ = retry, if self.retry_at.is_some() => {
                    self.retry_at = None;
                    // Off the loop, so Stop and disconnect can cancel the handshake.
                    let connector = self.connector.clone();
                    let endpoint = self.endpoint.clone();
                    self.attempt = Some(tokio::spawn(async move {
                        match connector.connect(&endpoint).await {
                            Ok(_) | Err(TransportError::Cancelled) => {}
                            // The failure also arrives as `Lost` and schedules the next try.
                            Err(e) => debug!(error = %e, "Reconnect attempt failed"),
                        }
                    }));
                }
            }
        }

        self.cancel_reconnect();
        self.abort_attempt().await;
        self.connector.disconnect().await;
        // Drain what the close produced so the log ends with it.
        while let Ok(event) = self.transport_events.try_recv() {
            self.on_transport(event);
        }
        info!("Live feed stopped");
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.cancel_reconnect();
                let line = format!("Connected to {}", self.endpoint.url);
                self.system_line(line);
            }
            TransportEvent::Frame(frame) => {
                self.ingest(frame);
            }
            TransportEvent::Lost { reason } => {
                self.system_line(format!("Connection lost: {}", reason));
                self.schedule_reconnect();
            }
            TransportEvent::Closed => {
                self.system_line("Disconnected".to_string());
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(policy) = self.reconnect else {
            return;
        };

        if !policy.allows(self.reconnect_attempts) {
            warn!(attempts = self.reconnect_attempts, "Giving up on reconnecting");
            let line = format!("Giving up after {} attempts", self.reconnect_attempts);
            self.system_line(line);
            return;
        }

        let delay = policy.delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.retry_at = Some(Instant::now() + delay);
        info!(delay_ms = delay.as_millis() as u64, attempt = self.reconnect_attempts, "Scheduling reconnect");
        let line = format!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            self.reconnect_attempts
        );
        self.system_line(line);
    }

    fn cancel_reconnect(&mut self) {
        self.retry_at = None;
        self.reconnect_attempts = 0;
    }

    /// Abort a reconnect handshake still in flight. Returns whether one was.
    ///
    /// An aborted handshake can leave the connector `Connecting`; follow
    /// with `Connector::disconnect` to reset it.
    async fn abort_attempt(&mut self) -> bool {
        let Some(attempt) = self.attempt.take() else {
            return false;
        };
        if attempt.is_finished() {
            return false;
        }
        attempt.abort();
        let _ = attempt.await;
        debug!("Aborted reconnect attempt");
        true
    }

    /// Log a lifecycle line unless the same line was logged moments ago.
    fn system_line(&mut self, text: String) {
        let key = format!("system:{}", text);
        if self.cache.should_ignore(&key, self.system_window) {
            debug!(line = %text, "Suppressed repeated system line");
            return;
        }
        self.log.push(LogKind::System, text, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::read;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::error::BackfillError;
    use crate::history::HistorySource;

    fn feed() -> LiveFeed {
        LiveFeed::new(&Settings::default(), Arc::new(DedupCache::default()))
    }

    fn chat_frame() -> InboundFrame {
        InboundFrame::new(
            json!({
                "event_type": "chat",
                "source_agent": {"id": "1", "username": "Ada"},
                "target_agents": [{"id": "2", "username": "Grace"}],
                "timestamp": "2024-01-01T00:00:00Z",
                "data": {"message": "hi"}
            })
            .to_string(),
        )
    }

    fn history_event(id: &str, ts: &str, source: &str, target: &str) -> Value {
        json!({
            "id": id,
            "event_type": "chat",
            "source_agent": {"id": source, "username": format!("agent-{}", source)},
            "target_agents": [{"id": target, "username": format!("agent-{}", target)}],
            "timestamp": ts,
            "data": {"message": format!("from {}", id)}
        })
    }

    #[test]
    fn test_event_builds_graph_and_pulse() {
        let mut feed = feed();
        let handle = feed.handle();
        let mut pulses = handle.pulses();

        assert_eq!(feed.ingest(chat_frame()), IngestOutcome::Applied);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.node_count(), 2);
        assert_eq!(snapshot.link_count(), 1);

        let link = read(&snapshot.links[0]).clone();
        assert_eq!(link.source_id, "1");
        assert_eq!(link.target_id, "2");
        assert_eq!(link.message.as_deref(), Some("hi"));

        assert_eq!(
            pulses.try_recv().unwrap(),
            Pulse {
                source_id: "1".to_string(),
                target_id: "2".to_string(),
                message: Some("hi".to_string()),
            }
        );
        assert!(pulses.try_recv().is_err());

        let log = handle.log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, LogKind::Event);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut feed = feed();
        let handle = feed.handle();
        let mut pulses = handle.pulses();

        feed.ingest(chat_frame());
        let first = handle.snapshot();

        assert_eq!(feed.ingest(chat_frame()), IngestOutcome::Suppressed);
        let second = handle.snapshot();

        assert_eq!(first.version, second.version);
        assert_eq!(first.node_values(), second.node_values());
        assert_eq!(first.link_values(), second.link_values());
        assert!(pulses.try_recv().is_ok());
        assert!(pulses.try_recv().is_err());
        assert_eq!(handle.log().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_shortly_after_is_suppressed() {
        let mut feed = feed();
        feed.ingest(chat_frame());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(feed.ingest(chat_frame()), IngestOutcome::Suppressed);
        assert_eq!(feed.handle().snapshot().link_count(), 1);
    }

    #[test]
    fn test_plain_text_is_logged_only() {
        let mut feed = feed();
        let handle = feed.handle();
        let before = handle.snapshot().version;

        assert_eq!(feed.ingest(InboundFrame::new("plain text")), IngestOutcome::Logged);

        let log = handle.log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, LogKind::Opaque);
        assert_eq!(log[0].text, "plain text");
        assert_eq!(log[0].payload, None);
        assert_eq!(handle.snapshot().version, before);
        assert_eq!(handle.snapshot().node_count(), 0);
    }

    #[test]
    fn test_invalid_json_event_is_logged_with_payload() {
        let mut feed = feed();
        let frame = InboundFrame::new(r#"{"event_type": "chat"}"#);
        assert_eq!(feed.ingest(frame), IngestOutcome::Logged);

        let log = feed.log().entries();
        assert_eq!(log[0].payload, Some(json!({"event_type": "chat"})));
        assert_eq!(feed.graph().snapshot().node_count(), 0);
    }

    #[test]
    fn test_shared_cache_spans_feeds() {
        let cache = Arc::new(DedupCache::default());
        let mut first = LiveFeed::new(&Settings::default(), Arc::clone(&cache));
        let mut second = LiveFeed::new(&Settings::default(), cache);

        assert_eq!(first.ingest(chat_frame()), IngestOutcome::Applied);
        assert_eq!(second.ingest(chat_frame()), IngestOutcome::Suppressed);
    }

    #[test]
    fn test_seed_orders_history_and_skips_pulses() {
        let mut feed = feed();
        let handle = feed.handle();
        let mut pulses = handle.pulses();

        let applied = feed.seed(vec![
            history_event("e2", "2024-01-01T00:00:02Z", "1", "2"),
            history_event("e1", "2024-01-01T00:00:01Z", "1", "2"),
            json!("not an event"),
            history_event("e3", "2024-01-01T00:00:03Z", "2", "3"),
        ]);

        assert_eq!(applied, 3);
        assert!(pulses.try_recv().is_err());

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.link_count(), 2);
        let link = snapshot.link("1", "2").unwrap();
        assert_eq!(read(&link).message.as_deref(), Some("from e2"));

        let texts: Vec<_> = handle.log().iter().map(|e| e.text.clone()).collect();
        assert!(texts[0].ends_with("from e1"));
        assert!(texts[2].ends_with("from e3"));
    }

    #[test]
    fn test_seeded_events_suppress_replay() {
        let mut feed = feed();
        let event = history_event("e1", "2024-01-01T00:00:01Z", "1", "2");
        feed.seed(vec![event.clone()]);

        let outcome = feed.ingest(InboundFrame::new(event.to_string()));
        assert_eq!(outcome, IngestOutcome::Suppressed);
    }

    struct FixedHistory(Vec<Value>);

    #[async_trait]
    impl HistorySource for FixedHistory {
        async fn recent(&self, _limit: u32) -> Result<Vec<Value>, BackfillError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_backfill_reports_origin() {
        let mut feed = feed();
        let source = Arc::new(FixedHistory(vec![history_event(
            "e1",
            "2024-01-01T00:00:01Z",
            "1",
            "2",
        )]));
        let report = feed.backfill(&Backfill::new(source)).await;

        assert_eq!(report.origin, BackfillOrigin::Remote);
        assert_eq!(report.applied, 1);
        assert_eq!(feed.handle().snapshot().link_count(), 1);
    }

    #[test]
    fn test_system_lines_are_deduped() {
        let mut feed = feed();
        feed.on_transport(TransportEvent::Lost {
            reason: "stream ended".to_string(),
        });
        feed.on_transport(TransportEvent::Lost {
            reason: "stream ended".to_string(),
        });
        feed.on_transport(TransportEvent::Closed);

        let texts: Vec<_> = feed.log().entries().iter().map(|e| e.text.clone()).collect();
        assert_eq!(texts, vec!["Connection lost: stream ended", "Disconnected"]);
        // Reconnecting is off by default.
        assert!(feed.retry_at.is_none());
    }

    #[test]
    fn test_frames_from_transport_are_ingested() {
        let mut feed = feed();
        feed.on_transport(TransportEvent::Frame(chat_frame()));
        assert_eq!(feed.graph().snapshot().node_count(), 2);
    }

    #[test]
    fn test_reconnect_policy_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(4), Duration::from_millis(16_000));
        assert_eq!(policy.delay(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay(200), Duration::from_millis(30_000));
        assert!(policy.allows(1_000));

        let bounded = ReconnectPolicy {
            max_attempts: 2,
            ..policy
        };
        assert!(bounded.allows(1));
        assert!(!bounded.allows(2));
    }

    #[test]
    fn test_reconnect_policy_from_settings() {
        let mut settings = ReconnectSettings::default();
        assert_eq!(ReconnectPolicy::from_settings(&settings), None);

        settings.enabled = true;
        settings.max_attempts = 3;
        let policy = ReconnectPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.initial_delay, Duration::from_millis(1_000));
        assert_eq!(policy.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_lost_schedules_reconnect_when_enabled() {
        let mut settings = Settings::default();
        settings.transport.reconnect.enabled = true;
        settings.transport.reconnect.max_attempts = 1;
        let mut feed = LiveFeed::new(&settings, Arc::new(DedupCache::default()));

        feed.on_transport(TransportEvent::Lost {
            reason: "reset".to_string(),
        });
        assert!(feed.retry_at.is_some());
        assert_eq!(feed.reconnect_attempts, 1);

        feed.retry_at = None;
        feed.on_transport(TransportEvent::Lost {
            reason: "reset again".to_string(),
        });
        assert!(feed.retry_at.is_none());

        feed.on_transport(TransportEvent::Connected);
        assert_eq!(feed.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_request() {
        let feed = feed();
        let handle = feed.handle();
        let task = tokio::spawn(feed.run());

        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handle_disconnect_and_send_are_safe_when_idle() {
        let feed = feed();
        let handle = feed.handle();
        handle.disconnect().await;
        handle.disconnect().await;
        assert!(!handle.send(&OutboundMessage::new("hi", crate::events::Target::Global)));
    }
}
