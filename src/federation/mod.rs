//! Federation protocol engine
//!
//! Handles:
//! - Activity construction and signing (outbox side)
//! - Scheduled delivery with bounded retries
//! - Inbound verification, parsing, and routing (inbox side)
//! - HTTP signatures and document proofs
//! - Public key caching
//! - Rate limiting

mod builder;
mod delivery;
mod document;
mod inbox;
mod key_cache;
mod outbox;
mod rate_limit;
mod signature;

pub use builder::ActivityBuilder;
pub use delivery::{
    AttemptOutcome, DeliveryScheduler, DeliveryTransport, HttpTransport, TransportResult,
};
pub use document::{ActivityDocument, parse_iso8601_seconds};
pub use inbox::{InboxResult, InboxRouter};
pub use key_cache::{CacheStats, PublicKeyCache};
pub use outbox::Outbox;
pub use rate_limit::{RateLimiter, extract_domain};
pub use signature::{
    SignatureHeaders, extract_signature_key_id, fetch_public_key, key_id_matches_actor,
    parse_signature_header, sign_document, sign_request, verify_document, verify_request,
};
