//! Canonical agent graph derived from the event stream.
//!
//! # Design
//!
//! - Agents, nodes and links are records addressed by a stable key and
//!   owned by the store as [`Shared`] handles. An upsert of an existing key
//!   mutates the record in place and returns the same handle, so a renderer
//!   holding the handle keeps its position and velocity state.
//! - Agent records (catalog) and nodes (rendering) are separate allocations
//!   under the same key so independent consumers never share mutable state.
//! - After every applied event a new [`GraphSnapshot`] is published with
//!   fresh collection allocations. In-flight readers of an older snapshot are
//!   never disturbed.
//! - Each new interaction emits one [`Pulse`] on a broadcast channel.
//!
//! The store is not `Sync`-shared: one task owns it and mutates it. Everyone
//! else goes through a [`GraphReader`].

mod snapshot;

pub use snapshot::{GraphReader, GraphSnapshot, Pulse, Shared, read, write};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::events::Event;

/// Label used when an agent arrives without a usable name.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Pulses buffered per subscriber before the slowest one starts lagging.
pub const PULSE_CAPACITY: usize = 256;

/// Catalog entry for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub username: String,
    pub mood: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    /// Interactions this agent initiated.
    pub interactions: u64,
}

/// Renderer-owned layout state. The store creates it and never writes it again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderState {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub vx: Option<f64>,
    pub vy: Option<f64>,
    pub pinned: bool,
}

/// Rendering-facing node for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub id: String,
    pub name: String,
    /// Stable per id; feeds avatar generation.
    pub avatar_seed: String,
    pub mood: Option<String>,
    pub render: RenderState,
}

/// Directed relation between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLink {
    pub source_id: String,
    pub target_id: String,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub interactions: u64,
}

/// What a single [`GraphStore::apply_event`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub new_agents: usize,
    pub new_links: usize,
    pub pulses: usize,
}

type LinkKey = (String, String);

/// Identity-preserving store of agents, nodes and links.
pub struct GraphStore {
    agents: HashMap<String, Shared<AgentRecord>>,
    agent_order: Vec<Shared<AgentRecord>>,
    nodes: HashMap<String, Shared<AgentNode>>,
    node_order: Vec<Shared<AgentNode>>,
    links: HashMap<LinkKey, Shared<AgentLink>>,
    link_order: Vec<Shared<AgentLink>>,
    version: u64,
    unknown_label: String,
    snapshot_tx: watch::Sender<GraphSnapshot>,
    snapshot_rx: watch::Receiver<GraphSnapshot>,
    pulse_tx: broadcast::Sender<Pulse>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new(UNKNOWN_LABEL)
    }
}

impl GraphStore {
    /// Create an empty store. `unknown_label` names agents sent without a username.
    pub fn new(unknown_label: impl Into<String>) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(GraphSnapshot::default());
        let (pulse_tx, _) = broadcast::channel(PULSE_CAPACITY);

        let unknown_label = unknown_label.into();
        Self {
            agents: HashMap::new(),
            agent_order: Vec::new(),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            links: HashMap::new(),
            link_order: Vec::new(),
            version: 0,
            unknown_label: if unknown_label.trim().is_empty() {
                UNKNOWN_LABEL.to_string()
            } else {
                unknown_label
            },
            snapshot_tx,
            snapshot_rx,
            pulse_tx,
        }
    }

    /// A consumer handle for snapshots and pulses.
    pub fn reader(&self) -> GraphReader {
        GraphReader {
            snapshots: self.snapshot_rx.clone(),
            pulses: self.pulse_tx.clone(),
        }
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<GraphSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to pulses emitted after this call.
    pub fn pulses(&self) -> broadcast::Receiver<Pulse> {
        self.pulse_tx.subscribe()
    }

    /// Look up an agent record.
    pub fn agent(&self, id: &str) -> Option<Shared<AgentRecord>> {
        self.agents.get(id).cloned()
    }

    /// All agent records, in first-seen order.
    pub fn agents(&self) -> &[Shared<AgentRecord>] {
        &self.agent_order
    }

    /// Insert or update an agent record.
    ///
    /// Blank `username`/`mood` never overwrite a known value, and
    /// `last_seen` only moves forward.
    pub fn upsert_agent(
        &mut self,
        id: &str,
        username: &str,
        mood: Option<&str>,
        last_seen: DateTime<Utc>,
    ) -> Shared<AgentRecord> {
        let username = non_blank(Some(username));
        let mood = non_blank(mood);

        if let Some(existing) = self.agents.get(id) {
            let mut record = write(existing);
            if let Some(username) = username {
                record.username = username.to_string();
            }
            if let Some(mood) = mood {
                record.mood = Some(mood.to_string());
            }
            if last_seen > record.last_seen_at {
                record.last_seen_at = last_seen;
            }
            drop(record);
            return Arc::clone(existing);
        }

        let record = Arc::new(RwLock::new(AgentRecord {
            id: id.to_string(),
            username: username.unwrap_or(self.unknown_label.as_str()).to_string(),
            mood: mood.map(str::to_string),
            last_seen_at: last_seen,
            interactions: 0,
        }));
        tracing::debug!(agent_id = id, "Registered new agent");
        self.agents.insert(id.to_string(), Arc::clone(&record));
        self.agent_order.push(Arc::clone(&record));
        record
    }

    /// Mirror an agent record onto its rendering node.
    pub fn upsert_node(&mut self, record: &AgentRecord) -> Shared<AgentNode> {
        if let Some(existing) = self.nodes.get(&record.id) {
            let mut node = write(existing);
            node.name = record.username.clone();
            node.mood = record.mood.clone();
            drop(node);
            return Arc::clone(existing);
        }

        let node = Arc::new(RwLock::new(AgentNode {
            id: record.id.clone(),
            name: record.username.clone(),
            avatar_seed: avatar_seed(&record.id),
            mood: record.mood.clone(),
            render: RenderState::default(),
        }));
        self.nodes.insert(record.id.clone(), Arc::clone(&node));
        self.node_order.push(Arc::clone(&node));
        node
    }

    /// Insert or update the link for the ordered pair `(source_id, target_id)`.
    ///
    /// An absent or blank `message` keeps the previous one.
    pub fn upsert_link(
        &mut self,
        source_id: &str,
        target_id: &str,
        message: Option<&str>,
        timestamp: DateTime<Utc>,
        event_type: &str,
    ) -> Shared<AgentLink> {
        let key = (source_id.to_string(), target_id.to_string());
        let message = non_blank(message);

        if let Some(existing) = self.links.get(&key) {
            let mut link = write(existing);
            if let Some(message) = message {
                link.message = Some(message.to_string());
            }
            if timestamp > link.timestamp {
                link.timestamp = timestamp;
            }
            link.event_type = event_type.to_string();
            link.interactions += 1;
            drop(link);
            return Arc::clone(existing);
        }

        let link = Arc::new(RwLock::new(AgentLink {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            message: message.map(str::to_string),
            timestamp,
            event_type: event_type.to_string(),
            interactions: 1,
        }));
        self.links.insert(key, Arc::clone(&link));
        self.link_order.push(Arc::clone(&link));
        link
    }

    /// Apply one admitted event, emit its pulses and publish a snapshot.
    pub fn apply_event(&mut self, event: &Event) -> ApplyOutcome {
        let outcome = self.apply(event, true);
        self.publish();
        outcome
    }

    /// Apply historical events without pulses and publish once.
    ///
    /// Returns the number of events applied.
    pub fn seed<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> usize {
        let mut applied = 0;
        for event in events {
            self.apply(event, false);
            applied += 1;
        }
        self.publish();
        applied
    }

    /// Publish the current collections as a new snapshot.
    pub fn publish(&mut self) {
        self.version += 1;
        let snapshot = GraphSnapshot {
            version: self.version,
            nodes: Arc::from(self.node_order.clone()),
            links: Arc::from(self.link_order.clone()),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    fn apply(&mut self, event: &Event, emit_pulses: bool) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let last_seen = event.parsed_timestamp().unwrap_or_else(Utc::now);
        let agents_before = self.agents.len();
        let links_before = self.links.len();

        let source = &event.source_agent;
        let source_record = self.upsert_agent(&source.id, &source.username, event.mood(), last_seen);
        let source_value = read(&source_record).clone();
        self.upsert_node(&source_value);

        for target in &event.target_agents {
            let target_record = self.upsert_agent(&target.id, &target.username, None, last_seen);
            let target_value = read(&target_record).clone();
            self.upsert_node(&target_value);

            self.upsert_link(
                &source.id,
                &target.id,
                event.message(),
                last_seen,
                &event.event_type,
            );
            write(&source_record).interactions += 1;

            if emit_pulses {
                let pulse = Pulse {
                    source_id: source.id.clone(),
                    target_id: target.id.clone(),
                    message: event.message().map(str::to_string),
                };
                // No subscribers is fine; pulses are fire-and-forget.
                let _ = self.pulse_tx.send(pulse);
                outcome.pulses += 1;
            }
        }

        outcome.new_agents = self.agents.len() - agents_before;
        outcome.new_links = self.links.len() - links_before;

        tracing::debug!(
            event_type = %event.event_type,
            source = %source.id,
            targets = event.target_agents.len(),
            new_agents = outcome.new_agents,
            new_links = outcome.new_links,
            "Applied event to graph"
        );

        outcome
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn avatar_seed(id: &str) -> String {
    blake3::hash(id.as_bytes()).to_hex()[..16].to_string()
}
