//! agentnet: live agent-network feed.
//!
//! Connects to an audit server's event stream, suppresses replayed frames,
//! normalizes agent-to-agent events and maintains an identity-preserving
//! interaction graph that renderers can read without copying.
//!
//! ```text
//! Connector ──TransportEvent──▶ LiveFeed ──▶ DedupCache (shared, process-wide)
//!                                  │
//!                                  ├──▶ GraphStore ──watch──▶ GraphSnapshot
//!                                  │               └─broadcast─▶ Pulse
//!                                  └──▶ RawLog ─────watch──▶ [LogEntry]
//! ```

pub mod dedup;
pub mod error;
pub mod events;
pub mod feed;
pub mod graph;
pub mod history;
pub mod settings;
pub mod transport;

pub use dedup::{DedupCache, fingerprint};
pub use error::{BackfillError, TransportError};
pub use events::{AgentIdentity, Classified, Event, InboundFrame, OutboundMessage, Target, classify};
pub use feed::{FeedHandle, IngestOutcome, LiveFeed, LogEntry, LogKind};
pub use graph::{AgentLink, AgentNode, AgentRecord, GraphSnapshot, GraphStore, Pulse, Shared};
pub use history::{Backfill, BackfillOrigin, HistorySource, HttpHistory};
pub use settings::Settings;
pub use transport::{ConnectOutcome, ConnectionState, Connector, Endpoint, TokenPlacement, TransportEvent};
