//! Typed activity documents
//!
//! Inbound payloads are duck-typed JSON on the wire; this module parses
//! them into a closed tagged union so the router dispatches with an
//! exhaustive match. Parsing is total: malformed input yields a
//! `Validation` error, never a panic.

use crate::data::ActivityKind;
use crate::error::AppError;

/// A parsed inbound activity
///
/// Each variant carries only the fields its handler needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityDocument {
    Create(CreateDoc),
    Like(InteractionDoc),
    Note(NoteDoc),
    Announce(InteractionDoc),
    Delete(DeleteDoc),
    Move(MoveDoc),
    Reject(RejectDoc),
}

/// Create activity carrying a video object
#[derive(Debug, Clone, PartialEq)]
pub struct CreateDoc {
    pub id: String,
    pub actor: String,
    pub object: VideoObject,
}

/// The content object of a Create activity
#[derive(Debug, Clone, PartialEq)]
pub struct VideoObject {
    /// Canonical object URI
    pub id: String,
    pub title: String,
    pub description: String,
    /// URL of the media to fetch
    pub media_url: String,
    pub media_type: Option<String>,
    /// Declared duration in seconds, parsed from ISO-8601 (PT180S)
    pub duration_seconds: Option<i64>,
    /// Declared size in bytes
    pub size_bytes: Option<i64>,
    /// Number of declared variant attachments
    pub attachment_count: usize,
}

/// Like or Announce referencing a target object
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionDoc {
    pub id: String,
    pub actor: String,
    pub target: String,
}

/// Note (reply) referencing the content it replies to
#[derive(Debug, Clone, PartialEq)]
pub struct NoteDoc {
    pub id: String,
    pub actor: String,
    /// URI of the content being replied to
    pub target: String,
    /// Raw HTML content; sanitized before storage
    pub content: String,
}

/// Delete referencing the object to remove
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteDoc {
    pub id: String,
    pub actor: String,
    pub target: String,
}

/// Move announcing an identity migration
#[derive(Debug, Clone, PartialEq)]
pub struct MoveDoc {
    pub id: String,
    pub actor: String,
    /// The identity being migrated, embedded in the payload
    pub moved_identity: String,
    /// The new endpoint
    pub new_endpoint: String,
}

/// Reject referencing a previously sent activity
#[derive(Debug, Clone, PartialEq)]
pub struct RejectDoc {
    pub id: String,
    pub actor: String,
    pub target: String,
    pub reason: Option<String>,
}

impl ActivityDocument {
    /// Parse a raw JSON document into a typed activity
    ///
    /// # Errors
    /// `Validation` for anything malformed: missing kind or actor,
    /// unknown kind, or missing variant-specific fields.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, AppError> {
        let object = raw
            .as_object()
            .ok_or_else(|| AppError::Validation("Activity is not a JSON object".to_string()))?;

        let kind_str = object
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;

        let kind = ActivityKind::parse(kind_str).ok_or_else(|| {
            AppError::Validation(format!("Unsupported activity type: {}", kind_str))
        })?;

        let id = required_str(raw, "id")?;
        let actor = required_str(raw, "actor")?;

        match kind {
            ActivityKind::Create => {
                let obj = raw
                    .get("object")
                    .ok_or_else(|| AppError::Validation("Missing object in Create".to_string()))?;

                // A Create wrapping a Note is a reply in disguise; route
                // it as one.
                let obj_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");
                if obj_type.eq_ignore_ascii_case("Note") {
                    return Ok(Self::Note(parse_note(obj, &actor)?));
                }

                Ok(Self::Create(CreateDoc {
                    id,
                    actor,
                    object: parse_video_object(obj)?,
                }))
            }
            ActivityKind::Like => Ok(Self::Like(InteractionDoc {
                id,
                actor,
                target: extract_object_reference(raw)?,
            })),
            ActivityKind::Announce => Ok(Self::Announce(InteractionDoc {
                id,
                actor,
                target: extract_object_reference(raw)?,
            })),
            ActivityKind::Note => Ok(Self::Note(parse_note(raw, &actor)?)),
            ActivityKind::Delete => Ok(Self::Delete(DeleteDoc {
                id,
                actor,
                target: extract_delete_target(raw)?,
            })),
            ActivityKind::Move => {
                let moved_identity = raw
                    .get("object")
                    .and_then(|o| o.as_str().map(str::to_string))
                    .or_else(|| {
                        raw.get("object")
                            .and_then(|o| o.get("id"))
                            .and_then(|id| id.as_str().map(str::to_string))
                    })
                    .ok_or_else(|| {
                        AppError::Validation("Missing moved identity in Move".to_string())
                    })?;
                let new_endpoint = required_str(raw, "target")?;

                Ok(Self::Move(MoveDoc {
                    id,
                    actor,
                    moved_identity,
                    new_endpoint,
                }))
            }
            ActivityKind::Reject => Ok(Self::Reject(RejectDoc {
                id,
                actor,
                target: extract_object_reference(raw)?,
                reason: raw
                    .get("summary")
                    .and_then(|s| s.as_str())
                    .map(str::to_string),
            })),
        }
    }

    pub fn kind(&self) -> ActivityKind {
        match self {
            Self::Create(_) => ActivityKind::Create,
            Self::Like(_) => ActivityKind::Like,
            Self::Note(_) => ActivityKind::Note,
            Self::Announce(_) => ActivityKind::Announce,
            Self::Delete(_) => ActivityKind::Delete,
            Self::Move(_) => ActivityKind::Move,
            Self::Reject(_) => ActivityKind::Reject,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Self::Create(doc) => &doc.id,
            Self::Like(doc) => &doc.id,
            Self::Note(doc) => &doc.id,
            Self::Announce(doc) => &doc.id,
            Self::Delete(doc) => &doc.id,
            Self::Move(doc) => &doc.id,
            Self::Reject(doc) => &doc.id,
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Self::Create(doc) => &doc.actor,
            Self::Like(doc) => &doc.actor,
            Self::Note(doc) => &doc.actor,
            Self::Announce(doc) => &doc.actor,
            Self::Delete(doc) => &doc.actor,
            Self::Move(doc) => &doc.actor,
            Self::Reject(doc) => &doc.actor,
        }
    }

    /// Identity of the object this activity acts upon, when present
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Create(doc) => Some(&doc.object.id),
            Self::Like(doc) => Some(&doc.target),
            Self::Note(doc) => Some(&doc.target),
            Self::Announce(doc) => Some(&doc.target),
            Self::Delete(doc) => Some(&doc.target),
            Self::Move(doc) => Some(&doc.new_endpoint),
            Self::Reject(doc) => Some(&doc.target),
        }
    }
}

fn required_str(raw: &serde_json::Value, field: &str) -> Result<String, AppError> {
    raw.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation(format!("Missing {} field", field)))
}

/// Resolve an `object` member to a URI, accepting both a plain string
/// and an embedded object with an `id`.
fn extract_object_reference(raw: &serde_json::Value) -> Result<String, AppError> {
    let object = raw
        .get("object")
        .ok_or_else(|| AppError::Validation("Missing object field".to_string()))?;

    object
        .as_str()
        .or_else(|| object.get("id").and_then(|id| id.as_str()))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Invalid object field".to_string()))
}

/// Resolve a Delete target, accepting a plain URI or a Tombstone object.
fn extract_delete_target(raw: &serde_json::Value) -> Result<String, AppError> {
    let object = raw
        .get("object")
        .ok_or_else(|| AppError::Validation("Missing object in Delete".to_string()))?;

    if let Some(uri) = object.as_str() {
        return Ok(uri.to_string());
    }

    let is_tombstone = object
        .get("type")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|value| value.eq_ignore_ascii_case("Tombstone"));

    let target = if is_tombstone {
        object
            .get("object")
            .and_then(serde_json::Value::as_str)
            .or_else(|| object.get("id").and_then(serde_json::Value::as_str))
    } else {
        object.get("id").and_then(serde_json::Value::as_str)
    };

    target
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Invalid object in Delete".to_string()))
}

fn parse_note(obj: &serde_json::Value, actor: &str) -> Result<NoteDoc, AppError> {
    let id = required_str(obj, "id")?;
    let target = obj
        .get("inReplyTo")
        .and_then(|r| r.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Note must be in reply to content".to_string()))?;
    let content = obj
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(NoteDoc {
        id,
        actor: actor.to_string(),
        target,
        content,
    })
}

fn parse_video_object(obj: &serde_json::Value) -> Result<VideoObject, AppError> {
    let obj_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if !obj_type.eq_ignore_ascii_case("Video") {
        return Err(AppError::Validation(format!(
            "Unsupported object type in Create: {}",
            obj_type
        )));
    }

    let id = required_str(obj, "id")?;
    let media_url = obj
        .get("url")
        .and_then(|u| u.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Missing url in video object".to_string()))?;

    Ok(VideoObject {
        id,
        title: obj
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("Untitled")
            .chars()
            .take(200)
            .collect(),
        description: obj
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .chars()
            .take(2000)
            .collect(),
        media_url,
        media_type: obj
            .get("mediaType")
            .and_then(|m| m.as_str())
            .map(str::to_string),
        duration_seconds: obj
            .get("duration")
            .and_then(|d| d.as_str())
            .and_then(parse_iso8601_seconds),
        size_bytes: obj.get("size").and_then(|s| s.as_i64()),
        attachment_count: obj
            .get("attachment")
            .and_then(|a| a.as_array())
            .map(|a| a.len())
            .unwrap_or(0),
    })
}

/// Parse an ISO-8601 duration of the `PT<number>S` form
pub fn parse_iso8601_seconds(duration: &str) -> Option<i64> {
    duration
        .strip_prefix("PT")?
        .strip_suffix('S')?
        .parse::<i64>()
        .ok()
        .filter(|seconds| *seconds >= 0)
}

/// Format a duration in seconds as `PT<number>S`
pub fn format_iso8601_seconds(seconds: i64) -> String {
    format!("PT{}S", seconds)
}
