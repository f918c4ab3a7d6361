//! # huddle-live: realtime collaboration state for a workspace client
//!
//! Mirrors activity, presence, message delivery, collaborative sessions and
//! shared files from a relational Remote Store, keeps the mirrors live via
//! its change channel, and applies local mutations write-through.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────────┐
//!                    │        LiveEngine         │
//!                    │ config · clock · identity │
//!                    └─────────────┬─────────────┘
//!        ┌─────────────┬───────────┼────────────┬─────────────┐
//!        ▼             ▼           ▼            ▼             ▼
//!  ActivityFeed  PresenceManager  DeliveryTracker  SessionManager  FileRegistry ...
//!        │             │           │            │             │
//!        └─────────────┴─────┬─────┴────────────┴─────────────┘
//!                            │ ChangeListener (on_change / on_stale / on_resync)
//!                            ▼
//!              ┌──────────────────────────┐  one subscription  ┌─────────────┐
//!              │  SubscriptionCoordinator │ ◄────per scope────► │ RemoteStore │
//!              │   (pump task + backoff)  │                     └─────────────┘
//!              └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: Remote Store boundary, filters, change streams, in-process store
//! - [`coordinator`]: one upstream subscription per scope, resubscribe with backoff
//! - [`feed`]: activity feed with optimistic read-marking
//! - [`presence`]: presence records, freshness window, owned heartbeat
//! - [`delivery`]: monotonic `sent → delivered → read` state machine
//! - [`sessions`]: collaborative sessions with compensated creation
//! - [`files`]: blob upload plus metadata registration
//! - [`preferences`]: notification preferences
//! - [`engine`]: lifecycle façade over all of the above
//!
//! ## Failure model
//!
//! | Failure        | Local effect                                   |
//! |----------------|------------------------------------------------|
//! | fetch          | error flag, empty cache                        |
//! | write-through  | optimistic change rolled back, error returned  |
//! | subscription   | stale flag, coordinator resubscribes, resync   |
//! | order violation| rejected before any write                      |

pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod feed;
pub mod files;
pub mod identity;
pub mod model;
pub mod preferences;
pub mod presence;
pub mod sessions;
pub mod state;
pub mod store;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffPolicy, EngineConfig};
pub use context::LiveContext;
pub use coordinator::{ChangeListener, SubscriptionCoordinator, SubscriptionScope, SubscriptionToken};
pub use delivery::DeliveryTracker;
pub use engine::LiveEngine;
pub use error::{LiveError, LiveResult, StoreError};
pub use feed::{ActivityFeed, FeedCache};
pub use files::{FileOptions, FileRegistry, FileUpload};
pub use identity::{ActorRole, IdentityProvider, StaticIdentity};
pub use model::{
    AccessLevel, ActivityDraft, ActivityItem, ActivityKind, CollaborativeSession, ConnectionStatus,
    DeliveryStatus, DigestFrequency, EntityRef, FileType, JsonMap, Message, MessageStatus,
    NotificationChannel, NotificationPreferences, ParticipantRole, PresenceRecord, PresenceStatus,
    QuietHours, Record, SessionParticipant, SessionStatus, SharedFile,
};
pub use preferences::PreferencesManager;
pub use presence::{PresenceCache, PresenceHandle, PresenceManager, Visibility};
pub use sessions::{SessionCache, SessionManager, SessionOptions};
pub use state::ViewState;
pub use store::{
    BlobStore, ChangeEvent, ChangeKind, ChangeStream, Filter, MemoryBlobStore, MemoryStore, Operation,
    Order, RemoteStore, Row, Table,
};
