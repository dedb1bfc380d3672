//! # agora-sync: real-time synchronization for live Q&A sessions
//!
//! Keeps every client of a session converging on the same state over a push
//! channel that may drop, duplicate or reorder notifications.
//!
//! ## Architecture
//!
//! ```text
//!  mutation ──► QnaService ──► SessionRepository ──► DocumentStore
//!                  │    │        (retry + CAS)        (Memory / RocksDB)
//!                  │    └──► UpdateScheduler ──► UpdatePublisher
//!                  │          (per-session debounce)
//!                  ▼
//!              PushHub / PushServer  ══ WebSocket ══►  WsPushChannel
//!              (session groups)                             │
//!                                                           ▼
//!                                      ConnectionManager ──► Reconciler ──► UiSink
//!                                      (connect + join)     (decide)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `PushMessage`)
//! - [`broadcast`]: session groups with bounded fan-out
//! - [`server`]: WebSocket push server
//! - [`channel`]: client push channel trait and the in-process channel
//! - [`transport`]: WebSocket push channel with transport reconnect
//! - [`reconcile`]: notification vs. cached state decisions
//! - [`lifecycle`]: client connection state machine
//! - [`scheduler`]: coalescing of outbound view updates
//! - [`storage`]: versioned document stores, retry, repository
//! - [`service`]: mutation entry point tying the above together

pub mod broadcast;
pub mod channel;
pub mod lifecycle;
pub mod protocol;
pub mod reconcile;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, GroupStats, HubError, HubStats, NotificationSink, PushHub};
pub use channel::{
    ChannelError, ChannelEvent, EventStream, LocalPushChannel, PushChannel, StaticToken, TokenSource,
};
pub use lifecycle::{
    ConnectionLimitState, ConnectionManager, ConnectionState, LifecycleConfig, SessionCache, UiSink,
};
pub use protocol::{ConnectionId, MessageType, ProtocolError, PushMessage, RejectReason};
pub use reconcile::{decide, Action, Reconciler};
pub use scheduler::{
    PendingUpdateTask, PublishError, SchedulerConfig, SchedulerStats, SessionViewSource, UpdatePublisher,
    UpdateScheduler,
};
pub use server::{PushServer, ServerConfig, ServerError, ServerStats};
pub use service::QnaService;
pub use storage::{
    with_retry, DocumentStore, MemoryStore, PersistenceError, RetryPolicy, RetryState, RocksStore,
    SessionRepository, StoreConfig, StoreError, Transient,
};
pub use transport::{WsChannelConfig, WsPushChannel};
