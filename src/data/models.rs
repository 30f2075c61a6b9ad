//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Local actors
// =============================================================================

/// A local identity this node can sign for
///
/// The private key never appears in any transmitted document;
/// only the public half is served to remote instances.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// Actor identity (local DID or actor URL)
    pub identity: String,
    /// Key identifier advertised in signatures (identity#main-key)
    pub key_id: String,
    /// RSA private key (PEM format)
    pub private_key_pem: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Activities
// =============================================================================

/// Activity kinds the engine understands
///
/// A closed set; the inbox router dispatches with an exhaustive match,
/// so an unhandled kind is a compile-visible gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Create,
    Like,
    Note,
    Announce,
    Delete,
    Move,
    Reject,
}

impl ActivityKind {
    /// Parse activity kind from its wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Like" => Some(Self::Like),
            "Note" => Some(Self::Note),
            "Announce" => Some(Self::Announce),
            "Delete" => Some(Self::Delete),
            "Move" => Some(Self::Move),
            "Reject" => Some(Self::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Like => "Like",
            Self::Note => "Note",
            Self::Announce => "Announce",
            Self::Delete => "Delete",
            Self::Move => "Move",
            Self::Reject => "Reject",
        }
    }
}

/// An immutable protocol message record
///
/// Created once by the activity builder (origin_local = true) or by the
/// inbox router on successful parse (origin_local = false). Never mutated
/// after creation; deleted only as a consequence of a verified Delete
/// targeting it, cascading to dependent delivery records.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: String,
    /// Globally unique URL-shaped identity, never reused
    pub uri: String,
    /// Wire name of the activity kind
    pub kind: String,
    /// Identity of the originating account
    pub actor: String,
    /// Identity of the object acted upon (absent for some kinds)
    pub target: Option<String>,
    /// Full canonical JSON document
    pub body: String,
    /// true if created locally, false if received from a remote party
    pub origin_local: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery records
// =============================================================================

/// Delivery record states
///
/// Transitions are monotone:
/// pending -> in_flight -> {delivered | pending (retry) | failed_permanent
/// | failed_exhausted}. The delivered and failed_* states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    FailedPermanent,
    FailedExhausted,
}

impl DeliveryState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "delivered" => Some(Self::Delivered),
            "failed_permanent" => Some(Self::FailedPermanent),
            "failed_exhausted" => Some(Self::FailedExhausted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::FailedPermanent => "failed_permanent",
            Self::FailedExhausted => "failed_exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::FailedPermanent | Self::FailedExhausted
        )
    }
}

/// One delivery record per (activity, destination inbox)
///
/// At most one worker may hold a record in `in_flight` at a time; the
/// claim is an atomic state-guarded UPDATE.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    pub id: String,
    /// Owning activity; destroyed with it
    pub activity_id: String,
    /// Originating actor, denormalized for per-endpoint FIFO claims
    pub actor: String,
    /// Destination inbox URL
    pub endpoint: String,
    pub state: String,
    /// Attempt count, starts at 0
    pub attempts: i64,
    /// Absent when the state is terminal
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Diagnostic from the last failed attempt
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Followers
// =============================================================================

/// A remote follower of a local actor
///
/// Inbox URL is stored for activity delivery and rewritten by verified
/// Move activities.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follower {
    pub id: String,
    /// The followed local identity
    pub local_actor: String,
    /// Remote follower identity (actor URL or DID)
    pub follower_actor: String,
    /// Remote inbox URL for delivery
    pub inbox_url: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Content
// =============================================================================

/// Where a content record originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Local,
    Federated,
}

impl ContentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Federated => "federated",
        }
    }
}

/// A content item the engine can route interactions to
///
/// Local rows are registered when content is published; federated rows
/// are created by inbound Create activities after successful ingest,
/// preserving the origin actor and origin endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentRecord {
    pub id: String,
    /// Canonical object URI
    pub uri: String,
    /// "local" or "federated"
    pub source: String,
    /// ID returned by the ingest collaborator (federated only)
    pub stored_content_id: Option<String>,
    /// The Create activity that produced this record
    pub activity_id: Option<String>,
    pub origin_actor: String,
    /// Origin instance endpoint (federated only)
    pub origin_endpoint: Option<String>,
    pub title: String,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<i64>,
    /// Federated interaction counters
    pub like_count: i64,
    pub share_count: i64,
    pub comment_count: i64,
    /// pending, approved, flagged
    pub moderation_status: String,
    pub created_at: DateTime<Utc>,
}

/// A federated reply attached to known content
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: String,
    /// URI of the content this replies to
    pub content_uri: String,
    pub author_actor: String,
    /// URI of the Note activity that carried the reply
    pub activity_uri: String,
    /// Sanitized HTML body
    pub body_html: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Endpoint health
// =============================================================================

/// Per-endpoint delivery health for operator visibility
///
/// Flagging an endpoint unreachable does not block future publish
/// attempts to it; endpoints may recover.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub consecutive_exhausted: i64,
    pub unreachable_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
