//! SQLite database operations
//!
//! All database access goes through this module.
//! Delivery record state transitions are single guarded UPDATE
//! statements, so every transition on a record is linearizable.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;
use crate::interfaces::{FollowerDirectory, KeyProvider};

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert a local actor with its key pair
    pub async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, identity, key_id, private_key_pem, public_key_pem, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.identity)
        .bind(&actor.key_id)
        .bind(&actor.private_key_pem)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a local actor by identity
    pub async fn get_actor(&self, identity: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE identity = ?")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get a local actor by advertised key ID
    pub async fn get_actor_by_key_id(&self, key_id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE key_id = ?")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Insert an activity record
    ///
    /// Activities are immutable; there is deliberately no update path.
    pub async fn insert_activity(&self, activity: &Activity) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO activities (
                id, uri, kind, actor, target, body, origin_local, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&activity.id)
        .bind(&activity.uri)
        .bind(&activity.kind)
        .bind(&activity.actor)
        .bind(&activity.target)
        .bind(&activity.body)
        .bind(activity.origin_local)
        .bind(activity.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get an activity by its globally unique URI
    pub async fn get_activity_by_uri(&self, uri: &str) -> Result<Option<Activity>, AppError> {
        let activity = sqlx::query_as::<_, Activity>("SELECT * FROM activities WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(activity)
    }

    /// Get an activity by local ID
    pub async fn get_activity(&self, id: &str) -> Result<Option<Activity>, AppError> {
        let activity = sqlx::query_as::<_, Activity>("SELECT * FROM activities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(activity)
    }

    /// Check whether an activity URI is already known
    pub async fn activity_exists(&self, uri: &str) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activities WHERE uri = ?")
            .bind(uri)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    /// List activities by actor, newest first (audit surface)
    pub async fn list_activities_by_actor(
        &self,
        actor: &str,
        limit: i64,
    ) -> Result<Vec<Activity>, AppError> {
        let activities = sqlx::query_as::<_, Activity>(
            "SELECT * FROM activities WHERE actor = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(actor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(activities)
    }

    /// Delete an activity and its dependent delivery records
    ///
    /// Used by the Delete cascade. Delivery records are removed explicitly
    /// in the same transaction rather than relying on the FK pragma.
    pub async fn delete_activity(&self, activity_id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM delivery_records WHERE activity_id = ?")
            .bind(activity_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM activities WHERE id = ?")
            .bind(activity_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Delivery records
    // =========================================================================

    /// Insert one pending delivery record
    pub async fn insert_delivery_record(&self, record: &DeliveryRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (
                id, activity_id, actor, endpoint, state, attempts,
                next_attempt_at, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.activity_id)
        .bind(&record.actor)
        .bind(&record.endpoint)
        .bind(&record.state)
        .bind(record.attempts)
        .bind(record.next_attempt_at)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim the next due delivery record
    ///
    /// Picks the earliest-due pending record whose older records for the
    /// same (endpoint, actor) pair are all terminal, preserving delivery
    /// order to one endpoint for activities from one actor. The claim is
    /// a state-guarded UPDATE; `rows_affected == 1` wins. Concurrent
    /// workers that lose the race retry on the next candidate.
    ///
    /// # Returns
    /// The claimed record (now `in_flight`) or None when nothing is due.
    pub async fn claim_due_delivery(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, AppError> {
        // Bounded retry: a lost claim race just means another worker took
        // the candidate; look for the next one.
        for _ in 0..8 {
            let candidate = sqlx::query_as::<_, DeliveryRecord>(
                r#"
                SELECT d.* FROM delivery_records d
                WHERE d.state = 'pending'
                  AND d.next_attempt_at <= ?
                  AND NOT EXISTS (
                      SELECT 1 FROM delivery_records e
                      WHERE e.endpoint = d.endpoint
                        AND e.actor = d.actor
                        AND e.state IN ('pending', 'in_flight')
                        AND e.created_at < d.created_at
                  )
                ORDER BY d.next_attempt_at ASC, d.created_at ASC
                LIMIT 1
                "#,
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(mut record) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                r#"
                UPDATE delivery_records
                SET state = 'in_flight', next_attempt_at = NULL, updated_at = ?
                WHERE id = ? AND state = 'pending'
                "#,
            )
            .bind(now)
            .bind(&record.id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                record.state = DeliveryState::InFlight.as_str().to_string();
                record.next_attempt_at = None;
                record.updated_at = now;
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// Transition an in-flight record to `delivered`
    pub async fn mark_delivered(&self, record_id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        self.finish_in_flight(record_id, DeliveryState::Delivered, None, now)
            .await
    }

    /// Transition an in-flight record to `failed_permanent`
    pub async fn mark_failed_permanent(
        &self,
        record_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.finish_in_flight(record_id, DeliveryState::FailedPermanent, Some(error), now)
            .await
    }

    /// Transition an in-flight record to `failed_exhausted`
    pub async fn mark_exhausted(
        &self,
        record_id: &str,
        attempts: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET state = 'failed_exhausted', attempts = ?, next_attempt_at = NULL,
                last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(attempts)
        .bind(error)
        .bind(now)
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Return an in-flight record to `pending` for a retry
    pub async fn reschedule_delivery(
        &self,
        record_id: &str,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET state = 'pending', attempts = ?, next_attempt_at = ?,
                last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_in_flight(
        &self,
        record_id: &str,
        state: DeliveryState,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET state = ?, attempts = attempts + 1, next_attempt_at = NULL,
                last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(state.as_str())
        .bind(error)
        .bind(now)
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Cancel all pending deliveries for an activity
    ///
    /// Cancelled records move directly to `failed_permanent` with reason
    /// "cancelled", regardless of their current attempt count.
    ///
    /// # Returns
    /// Number of cancelled records.
    pub async fn cancel_pending_deliveries(
        &self,
        activity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET state = 'failed_permanent', next_attempt_at = NULL,
                last_error = 'cancelled', updated_at = ?
            WHERE activity_id = ? AND state = 'pending'
            "#,
        )
        .bind(now)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// List delivery records for an activity (audit surface)
    pub async fn list_deliveries_by_activity(
        &self,
        activity_id: &str,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE activity_id = ? ORDER BY created_at ASC",
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// List delivery records for an endpoint, newest first (audit surface)
    pub async fn list_deliveries_by_endpoint(
        &self,
        endpoint: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE endpoint = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(endpoint)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// List pending delivery records for an endpoint
    pub async fn list_pending_deliveries(
        &self,
        endpoint: &str,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE endpoint = ? AND state = 'pending' ORDER BY created_at ASC",
        )
        .bind(endpoint)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // =========================================================================
    // Endpoint health
    // =========================================================================

    /// Record an exhausted delivery for an endpoint
    ///
    /// The consecutive counter restarts when the previous observation
    /// falls outside the window.
    ///
    /// # Returns
    /// The updated consecutive-exhausted count.
    pub async fn note_endpoint_exhausted(
        &self,
        endpoint: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<i64, AppError> {
        let window_start = now - window;
        let existing = sqlx::query_as::<_, EndpointHealth>(
            "SELECT * FROM endpoint_health WHERE endpoint = ?",
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        let count = match existing {
            Some(health) if health.updated_at >= window_start => health.consecutive_exhausted + 1,
            _ => 1,
        };

        sqlx::query(
            r#"
            INSERT INTO endpoint_health (endpoint, consecutive_exhausted, unreachable_since, updated_at)
            VALUES (?, ?, NULL, ?)
            ON CONFLICT(endpoint) DO UPDATE SET
                consecutive_exhausted = excluded.consecutive_exhausted,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(endpoint)
        .bind(count)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(count)
    }

    /// Reset an endpoint's exhausted streak after a successful delivery
    pub async fn note_endpoint_delivered(
        &self,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO endpoint_health (endpoint, consecutive_exhausted, unreachable_since, updated_at)
            VALUES (?, 0, NULL, ?)
            ON CONFLICT(endpoint) DO UPDATE SET
                consecutive_exhausted = 0,
                unreachable_since = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(endpoint)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flag an endpoint unreachable for operator visibility
    pub async fn flag_endpoint_unreachable(
        &self,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE endpoint_health
            SET unreachable_since = COALESCE(unreachable_since, ?), updated_at = ?
            WHERE endpoint = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(endpoint)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get health state for an endpoint
    pub async fn get_endpoint_health(
        &self,
        endpoint: &str,
    ) -> Result<Option<EndpointHealth>, AppError> {
        let health = sqlx::query_as::<_, EndpointHealth>(
            "SELECT * FROM endpoint_health WHERE endpoint = ?",
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(health)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Insert a follower entry
    pub async fn insert_follower(&self, follower: &Follower) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO followers (id, local_actor, follower_actor, inbox_url, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&follower.id)
        .bind(&follower.local_actor)
        .bind(&follower.follower_actor)
        .bind(&follower.inbox_url)
        .bind(follower.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List all follower entries for a remote actor identity
    pub async fn list_followers_by_remote_actor(
        &self,
        follower_actor: &str,
    ) -> Result<Vec<Follower>, AppError> {
        let followers = sqlx::query_as::<_, Follower>(
            "SELECT * FROM followers WHERE follower_actor = ? ORDER BY created_at ASC",
        )
        .bind(follower_actor)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    // =========================================================================
    // Content
    // =========================================================================

    /// Insert a content record
    pub async fn insert_content(&self, content: &ContentRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO content_records (
                id, uri, source, stored_content_id, activity_id, origin_actor,
                origin_endpoint, title, duration_seconds, size_bytes,
                like_count, share_count, comment_count, moderation_status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&content.id)
        .bind(&content.uri)
        .bind(&content.source)
        .bind(&content.stored_content_id)
        .bind(&content.activity_id)
        .bind(&content.origin_actor)
        .bind(&content.origin_endpoint)
        .bind(&content.title)
        .bind(content.duration_seconds)
        .bind(content.size_bytes)
        .bind(content.like_count)
        .bind(content.share_count)
        .bind(content.comment_count)
        .bind(&content.moderation_status)
        .bind(content.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a content record by object URI
    pub async fn get_content_by_uri(&self, uri: &str) -> Result<Option<ContentRecord>, AppError> {
        let content =
            sqlx::query_as::<_, ContentRecord>("SELECT * FROM content_records WHERE uri = ?")
                .bind(uri)
                .fetch_optional(&self.pool)
                .await?;

        Ok(content)
    }

    /// Delete a content record by object URI
    pub async fn delete_content_by_uri(&self, uri: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM content_records WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Increment the federated like counter for a content URI
    ///
    /// # Returns
    /// `true` if a matching content row was updated.
    pub async fn increment_like_count(&self, uri: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE content_records SET like_count = like_count + 1 WHERE uri = ?")
                .bind(uri)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Increment the federated share counter for a content URI
    pub async fn increment_share_count(&self, uri: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE content_records SET share_count = share_count + 1 WHERE uri = ?")
                .bind(uri)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record the moderation verdict for stored content
    pub async fn set_moderation_status(
        &self,
        content_id: &str,
        status: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE content_records SET moderation_status = ? WHERE id = ?")
            .bind(status)
            .bind(content_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert a comment and bump the target's comment counter
    pub async fn insert_comment(&self, comment: &Comment) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO comments (id, content_uri, author_actor, activity_uri, body_html, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&comment.id)
        .bind(&comment.content_uri)
        .bind(&comment.author_actor)
        .bind(&comment.activity_uri)
        .bind(&comment.body_html)
        .bind(comment.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE content_records SET comment_count = comment_count + 1 WHERE uri = ?",
        )
        .bind(&comment.content_uri)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// List comments for a content URI
    pub async fn list_comments(&self, content_uri: &str) -> Result<Vec<Comment>, AppError> {
        let comments = sqlx::query_as::<_, Comment>(
            "SELECT * FROM comments WHERE content_uri = ? ORDER BY created_at ASC",
        )
        .bind(content_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(comments)
    }
}

#[async_trait]
impl KeyProvider for Database {
    async fn resolve_public_key(&self, key_id: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .get_actor_by_key_id(key_id)
            .await?
            .map(|actor| actor.public_key_pem))
    }

    async fn resolve_signing_key(&self, actor: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .get_actor(actor)
            .await?
            .map(|record| record.private_key_pem))
    }
}

#[async_trait]
impl FollowerDirectory for Database {
    async fn list_follower_inboxes(&self, actor: &str) -> Result<Vec<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>(
            "SELECT inbox_url FROM followers WHERE local_actor = ? ORDER BY created_at ASC",
        )
        .bind(actor)
        .fetch_all(&self.pool)
        .await?;

        Ok(inboxes)
    }

    async fn update_follower_endpoint(
        &self,
        old_actor: &str,
        new_endpoint: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("UPDATE followers SET inbox_url = ? WHERE follower_actor = ?")
            .bind(new_endpoint)
            .bind(old_actor)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
