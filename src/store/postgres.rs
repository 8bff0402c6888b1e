use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client as RedisClient};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tokio::sync::broadcast;

use super::{
    CHANGE_CHANNEL_CAPACITY, ChangeEvent, Collection, GroupQuery, ReconcileReport, Store,
    ToggleOutcome,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    Answer, ChatMessage, Comment, EventDetails, Group, GroupSettings, GroupStats, Member,
    MemberStatus, MembershipRequest, MessageStatus, Post, REPORT_THRESHOLD, Reaction,
    ReactionKind, Report, ReportOutcome, RequestStatus, Resolution, ResolveOutcome, Role,
    SkillLevel, UserProfile,
};

const GROUP_CACHE_EXPIRE: u64 = 600; // seconds
const GROUP_ID_CACHE_PREFIX: &str = "group:id:";

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[derive(FromRow)]
struct GroupRow {
    group_id: String,
    kind: String,
    owner_id: String,
    name: String,
    description: String,
    settings: Json<GroupSettings>,
    event: Option<Json<EventDetails>>,
    member_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<GroupRow> for Group {
    type Error = AppError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        Ok(Group {
            group_id: row.group_id,
            kind: row.kind.parse()?,
            owner_id: row.owner_id,
            name: row.name,
            description: row.description,
            settings: row.settings.0,
            event: row.event.map(|e| e.0),
            stats: GroupStats {
                member_count: row.member_count.max(0) as u32,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct MemberRow {
    group_id: String,
    user_id: String,
    display_name: String,
    role: String,
    status: String,
    joined_at: DateTime<Utc>,
}

impl TryFrom<MemberRow> for Member {
    type Error = AppError;

    fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
        Ok(Member {
            group_id: row.group_id,
            user_id: row.user_id,
            display_name: row.display_name,
            role: row.role.parse()?,
            status: row.status.parse()?,
            joined_at: row.joined_at,
        })
    }
}

#[derive(FromRow)]
struct RequestRow {
    request_id: String,
    group_id: String,
    user_id: String,
    requester_name: String,
    answers: Json<Vec<Answer>>,
    status: String,
    submitted_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
    reviewed_by: Option<String>,
    rejection_reason: Option<String>,
}

impl TryFrom<RequestRow> for MembershipRequest {
    type Error = AppError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        Ok(MembershipRequest {
            request_id: row.request_id,
            group_id: row.group_id,
            user_id: row.user_id,
            requester_name: row.requester_name,
            answers: row.answers.0,
            status: row.status.parse()?,
            submitted_at: row.submitted_at,
            responded_at: row.responded_at,
            reviewed_by: row.reviewed_by,
            rejection_reason: row.rejection_reason,
        })
    }
}

#[derive(FromRow)]
struct PostRow {
    post_id: String,
    group_id: String,
    author_id: String,
    author_name: String,
    author_role: String,
    text: String,
    image_urls: Json<Vec<String>>,
    pinned: bool,
    comments_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            post_id: row.post_id,
            group_id: row.group_id,
            author_id: row.author_id,
            author_name: row.author_name,
            author_role: row.author_role,
            text: row.text,
            image_urls: row.image_urls.0,
            pinned: row.pinned,
            comments_count: row.comments_count.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ReactionRow {
    post_id: String,
    user_id: String,
    kind: String,
    reacted_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct CommentRow {
    comment_id: String,
    post_id: String,
    group_id: String,
    author_id: String,
    author_name: String,
    content: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Comment {
            comment_id: row.comment_id,
            post_id: row.post_id,
            group_id: row.group_id,
            author_id: row.author_id,
            author_name: row.author_name,
            content: row.content,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MessageRow {
    message_id: String,
    event_id: String,
    author_id: String,
    author_name: String,
    content: String,
    status: String,
    is_organizer: bool,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ReportRow {
    message_id: String,
    reporter_id: String,
    reason: String,
    description: Option<String>,
    reported_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for Report {
    type Error = AppError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        Ok(Report {
            reporter_id: row.reporter_id,
            reason: row.reason.parse()?,
            description: row.description,
            reported_at: row.reported_at,
        })
    }
}

#[derive(FromRow)]
struct ProfileRow {
    uid: String,
    display_name: String,
    age: Option<i32>,
    favorite_sports: Json<Vec<String>>,
    skill_levels: Json<std::collections::BTreeMap<String, SkillLevel>>,
    location: Option<String>,
    updated_at: DateTime<Utc>,
}

const GROUP_COLUMNS: &str = "group_id, kind, owner_id, name, description, settings, event, \
                             member_count, created_at, updated_at";
const MEMBER_COLUMNS: &str = "group_id, user_id, display_name, role, status, joined_at";
const REQUEST_COLUMNS: &str = "request_id, group_id, user_id, requester_name, answers, status, \
                               submitted_at, responded_at, reviewed_by, rejection_reason";
const POST_COLUMNS: &str = "post_id, group_id, author_id, author_name, author_role, text, \
                            image_urls, pinned, comments_count, created_at, updated_at";
const COMMENT_COLUMNS: &str =
    "comment_id, post_id, group_id, author_id, author_name, content, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "message_id, event_id, author_id, author_name, content, status, is_organizer, created_at";

/// Postgres-backed store with a redis cache-aside layer for group snapshots.
pub struct PgStore {
    pool: PgPool,
    redis: Arc<RedisClient>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl PgStore {
    pub fn new(pool: PgPool, redis: Arc<RedisClient>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            pool,
            redis,
            changes,
        }
    }

    /// Creates missing tables and indexes.
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        tracing::info!("Database schema is up to date");
        Ok(())
    }

    fn publish(&self, collection: Collection, group_id: &str, entity_id: &str) {
        let _ = self
            .changes
            .send(ChangeEvent::new(collection, group_id, entity_id));
    }

    async fn cached_group(&self, group_id: &str) -> Option<Group> {
        let cache_key = format!("{}{}", GROUP_ID_CACHE_PREFIX, group_id);
        let mut conn = self.redis.get_multiplexed_async_connection().await.ok()?;
        let json_str: String = conn.get(&cache_key).await.ok()?;
        let group = serde_json::from_str::<Group>(&json_str).ok()?;
        tracing::debug!("Get group from cache: {}", cache_key);
        Some(group)
    }

    async fn cache_group(&self, group: &Group) {
        let cache_key = format!("{}{}", GROUP_ID_CACHE_PREFIX, group.group_id);
        if let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await {
            if let Ok(json_str) = serde_json::to_string(group) {
                let result: Result<(), redis::RedisError> =
                    conn.set_ex(&cache_key, json_str, GROUP_CACHE_EXPIRE).await;
                match result {
                    Ok(()) => tracing::debug!("Set group to cache: {}", cache_key),
                    Err(e) => tracing::warn!("Failed to cache group {}: {}", cache_key, e),
                }
            }
        }
    }

    async fn invalidate_group(&self, group_id: &str) {
        if let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await {
            let cache_key = format!("{}{}", GROUP_ID_CACHE_PREFIX, group_id);
            let _: Result<(), redis::RedisError> = conn.del(&cache_key).await;
        }
    }

    async fn reports_for(
        conn: &mut PgConnection,
        message_ids: &[String],
    ) -> AppResult<HashMap<String, Vec<Report>>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            "SELECT message_id, reporter_id, reason, description, reported_at \
             FROM message_reports WHERE message_id = ANY($1) ORDER BY reported_at",
        )
        .bind(message_ids)
        .fetch_all(conn)
        .await?;
        let mut by_message: HashMap<String, Vec<Report>> = HashMap::new();
        for row in rows {
            let message_id = row.message_id.clone();
            by_message
                .entry(message_id)
                .or_default()
                .push(Report::try_from(row)?);
        }
        Ok(by_message)
    }

    async fn load_message(
        conn: &mut PgConnection,
        message_id: &str,
    ) -> AppResult<Option<ChatMessage>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut reports = Self::reports_for(conn, &[row.message_id.clone()]).await?;
        let attached = reports.remove(&row.message_id).unwrap_or_default();
        Ok(Some(message_from_row(row, attached)?))
    }
}

fn message_from_row(row: MessageRow, reports: Vec<Report>) -> AppResult<ChatMessage> {
    Ok(ChatMessage {
        message_id: row.message_id,
        event_id: row.event_id,
        author_id: row.author_id,
        author_name: row.author_name,
        content: row.content,
        status: row.status.parse()?,
        is_organizer: row.is_organizer,
        reports,
        created_at: row.created_at,
    })
}

/// Activates the membership and bumps the counter on the same connection.
/// The counter only moves while the group has room; otherwise `GroupFull`
/// is returned and the caller's transaction rolls back on drop.
async fn admit(conn: &mut PgConnection, member: &Member) -> AppResult<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO group_members (group_id, user_id, display_name, role, status, joined_at)
        VALUES ($1, $2, $3, $4, 'active', $5)
        ON CONFLICT (group_id, user_id) DO UPDATE
            SET status = 'active',
                role = EXCLUDED.role,
                display_name = EXCLUDED.display_name,
                joined_at = EXCLUDED.joined_at
            WHERE group_members.status <> 'active'
        "#,
    )
    .bind(&member.group_id)
    .bind(&member.user_id)
    .bind(&member.display_name)
    .bind(member.role.as_str())
    .bind(member.joined_at)
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        let bumped = sqlx::query(
            r#"
            UPDATE groups SET member_count = member_count + 1
            WHERE group_id = $1
              AND (settings->>'max_members' IS NULL
                   OR member_count < (settings->>'max_members')::INTEGER)
            "#,
        )
        .bind(&member.group_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if bumped == 0 {
            return Err(AppError::GroupFull);
        }
    }
    Ok(inserted)
}

async fn decrement_members(conn: &mut PgConnection, group_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE groups SET member_count = GREATEST(member_count - 1, 0) WHERE group_id = $1",
    )
    .bind(group_id)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn insert_group(&self, group: &Group, owner: &Member) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO groups (
                group_id, kind, owner_id, name, description,
                settings, event, member_count, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9)
            "#,
        )
        .bind(&group.group_id)
        .bind(group.kind.as_str())
        .bind(&group.owner_id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(Json(&group.settings))
        .bind(group.event.as_ref().map(Json))
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&mut *tx)
        .await?;

        // the owner is the first member
        admit(&mut *tx, owner).await?;
        tx.commit().await?;

        self.publish(Collection::Groups, &group.group_id, &group.group_id);
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> AppResult<Option<Group>> {
        if let Some(group) = self.cached_group(group_id).await {
            return Ok(Some(group));
        }

        let row: Option<GroupRow> = sqlx::query_as(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups WHERE group_id = $1"
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        let group = row.map(Group::try_from).transpose()?;
        if let Some(ref g) = group {
            self.cache_group(g).await;
            // a write may have committed and invalidated between our read
            // and the cache write above
            let current: Option<(i32, DateTime<Utc>)> = sqlx::query_as(
                "SELECT member_count, updated_at FROM groups WHERE group_id = $1",
            )
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
            if current != Some((g.stats.member_count as i32, g.updated_at)) {
                tracing::debug!("Group {} changed while caching, dropping entry", group_id);
                self.invalidate_group(group_id).await;
            }
        }
        Ok(group)
    }

    async fn list_groups(&self, query: &GroupQuery) -> AppResult<Vec<Group>> {
        let limit = query.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows: Vec<GroupRow> = sqlx::query_as(&format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM groups g
            WHERE ($1::TEXT IS NULL OR g.kind = $1)
              AND ($2::TEXT IS NULL OR EXISTS (
                    SELECT 1 FROM group_members m
                    WHERE m.group_id = g.group_id AND m.user_id = $2 AND m.status = 'active'))
            ORDER BY g.created_at DESC, g.group_id
            LIMIT $3
            "#
        ))
        .bind(query.kind.map(|k| k.as_str()))
        .bind(query.member_id.as_deref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Group::try_from).collect()
    }

    async fn update_group(&self, group: &Group) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE groups
            SET name = $2, description = $3, settings = $4, event = $5, updated_at = $6
            WHERE group_id = $1
            "#,
        )
        .bind(&group.group_id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(Json(&group.settings))
        .bind(group.event.as_ref().map(Json))
        .bind(group.updated_at)
        .execute(&self.pool)
        .await?;

        self.invalidate_group(&group.group_id).await;
        self.publish(Collection::Groups, &group.group_id, &group.group_id);
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        // dependents first, then the group itself
        sqlx::query(
            "DELETE FROM message_reports WHERE message_id IN \
             (SELECT message_id FROM chat_messages WHERE event_id = $1)",
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chat_messages WHERE event_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM post_reactions WHERE post_id IN \
             (SELECT post_id FROM posts WHERE group_id = $1)",
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM post_comments WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM posts WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM membership_requests WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM groups WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;
        tx.commit().await?;

        self.invalidate_group(group_id).await;
        if deleted {
            self.publish(Collection::Groups, group_id, group_id);
        }
        Ok(deleted)
    }

    async fn get_member(&self, group_id: &str, user_id: &str) -> AppResult<Option<Member>> {
        let row: Option<MemberRow> = sqlx::query_as(&format!(
            "SELECT {MEMBER_COLUMNS} FROM group_members WHERE group_id = $1 AND user_id = $2"
        ))
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Member::try_from).transpose()
    }

    async fn list_members(&self, group_id: &str) -> AppResult<Vec<Member>> {
        let rows: Vec<MemberRow> = sqlx::query_as(&format!(
            "SELECT {MEMBER_COLUMNS} FROM group_members WHERE group_id = $1 ORDER BY joined_at"
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Member::try_from).collect()
    }

    async fn add_member(&self, member: &Member) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let added = admit(&mut *tx, member).await?;
        tx.commit().await?;

        if added {
            self.invalidate_group(&member.group_id).await;
            self.publish(Collection::Members, &member.group_id, &member.user_id);
        }
        Ok(added)
    }

    async fn remove_member(&self, group_id: &str, user_id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> = sqlx::query_scalar(
            "DELETE FROM group_members WHERE group_id = $1 AND user_id = $2 RETURNING status",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if status.as_deref() == Some(MemberStatus::Active.as_str()) {
            decrement_members(&mut *tx, group_id).await?;
        }
        tx.commit().await?;

        let removed = status.is_some();
        if removed {
            self.invalidate_group(group_id).await;
            self.publish(Collection::Members, group_id, user_id);
        }
        Ok(removed)
    }

    async fn set_member_status(
        &self,
        group_id: &str,
        user_id: &str,
        status: MemberStatus,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE group_members SET status = $3 \
             WHERE group_id = $1 AND user_id = $2 AND status <> $3",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if changed {
            match status {
                MemberStatus::Removed => decrement_members(&mut *tx, group_id).await?,
                MemberStatus::Active => {
                    sqlx::query(
                        "UPDATE groups SET member_count = member_count + 1 WHERE group_id = $1",
                    )
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;

        if changed {
            self.invalidate_group(group_id).await;
            self.publish(Collection::Members, group_id, user_id);
        }
        Ok(changed)
    }

    async fn set_member_role(&self, group_id: &str, user_id: &str, role: Role) -> AppResult<bool> {
        let changed = sqlx::query(
            "UPDATE group_members SET role = $3 WHERE group_id = $1 AND user_id = $2",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        if changed {
            self.publish(Collection::Members, group_id, user_id);
        }
        Ok(changed)
    }

    async fn insert_request(&self, request: &MembershipRequest) -> AppResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO membership_requests (
                request_id, group_id, user_id, requester_name, answers, status, submitted_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            ON CONFLICT (group_id, user_id) WHERE status = 'pending' DO NOTHING
            "#,
        )
        .bind(&request.request_id)
        .bind(&request.group_id)
        .bind(&request.user_id)
        .bind(&request.requester_name)
        .bind(Json(&request.answers))
        .bind(request.submitted_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            self.publish(Collection::Requests, &request.group_id, &request.request_id);
        }
        Ok(inserted)
    }

    async fn get_request(&self, request_id: &str) -> AppResult<Option<MembershipRequest>> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM membership_requests WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MembershipRequest::try_from).transpose()
    }

    async fn find_pending_request(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> AppResult<Option<MembershipRequest>> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM membership_requests \
             WHERE group_id = $1 AND user_id = $2 AND status = 'pending'"
        ))
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MembershipRequest::try_from).transpose()
    }

    async fn list_requests(
        &self,
        group_id: &str,
        status: Option<RequestStatus>,
    ) -> AppResult<Vec<MembershipRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM membership_requests \
             WHERE group_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY submitted_at"
        ))
        .bind(group_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MembershipRequest::try_from).collect()
    }

    async fn resolve_request(
        &self,
        request_id: &str,
        resolution: &Resolution,
        admit_member: Option<&Member>,
    ) -> AppResult<ResolveOutcome> {
        let mut tx = self.pool.begin().await?;
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM membership_requests WHERE request_id = $1 FOR UPDATE"
        ))
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut request = match row {
            Some(row) => MembershipRequest::try_from(row)?,
            None => return Err(AppError::NotFound("request")),
        };
        if request.status != RequestStatus::Pending {
            return Ok(ResolveOutcome::AlreadyResolved(request));
        }

        sqlx::query(
            r#"
            UPDATE membership_requests
            SET status = $2, reviewed_by = $3, responded_at = $4, rejection_reason = $5
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .bind(resolution.status.as_str())
        .bind(&resolution.reviewer_id)
        .bind(resolution.responded_at)
        .bind(resolution.reason.as_deref())
        .execute(&mut *tx)
        .await?;

        if let Some(member) = admit_member {
            admit(&mut *tx, member).await?;
        }
        tx.commit().await?;

        request.status = resolution.status;
        request.reviewed_by = Some(resolution.reviewer_id.clone());
        request.responded_at = Some(resolution.responded_at);
        request.rejection_reason = resolution.reason.clone();

        if admit_member.is_some() {
            self.invalidate_group(&request.group_id).await;
        }
        self.publish(Collection::Requests, &request.group_id, request_id);
        Ok(ResolveOutcome::Resolved(request))
    }

    async fn cancel_pending_request(&self, group_id: &str, user_id: &str) -> AppResult<bool> {
        let cancelled = sqlx::query(
            "DELETE FROM membership_requests \
             WHERE group_id = $1 AND user_id = $2 AND status = 'pending'",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        if cancelled {
            self.publish(Collection::Requests, group_id, user_id);
        }
        Ok(cancelled)
    }

    async fn insert_post(&self, post: &Post) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (
                post_id, group_id, author_id, author_name, author_role, text,
                image_urls, pinned, comments_count, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10)
            "#,
        )
        .bind(&post.post_id)
        .bind(&post.group_id)
        .bind(&post.author_id)
        .bind(&post.author_name)
        .bind(&post.author_role)
        .bind(&post.text)
        .bind(Json(&post.image_urls))
        .bind(post.pinned)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await?;
        self.publish(Collection::Posts, &post.group_id, &post.post_id);
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> AppResult<Option<Post>> {
        let row: Option<PostRow> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE post_id = $1"
        ))
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Post::from))
    }

    async fn list_posts(&self, group_id: &str) -> AppResult<Vec<Post>> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE group_id = $1 ORDER BY created_at DESC"
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Post::from).collect())
    }

    async fn set_post_pinned(&self, post_id: &str, pinned: bool) -> AppResult<bool> {
        let group_id: Option<String> = sqlx::query_scalar(
            "UPDATE posts SET pinned = $2, updated_at = NOW() WHERE post_id = $1 RETURNING group_id",
        )
        .bind(post_id)
        .bind(pinned)
        .fetch_optional(&self.pool)
        .await?;
        match group_id {
            Some(group_id) => {
                self.publish(Collection::Posts, &group_id, post_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_post(&self, post_id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM post_reactions WHERE post_id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM post_comments WHERE post_id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        let group_id: Option<String> =
            sqlx::query_scalar("DELETE FROM posts WHERE post_id = $1 RETURNING group_id")
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        match group_id {
            Some(group_id) => {
                self.publish(Collection::Posts, &group_id, post_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn toggle_reaction(
        &self,
        post_id: &str,
        user_id: &str,
        kind: ReactionKind,
        at: DateTime<Utc>,
    ) -> AppResult<ToggleOutcome> {
        let mut tx = self.pool.begin().await?;
        let group_id: Option<String> =
            sqlx::query_scalar("SELECT group_id FROM posts WHERE post_id = $1")
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(group_id) = group_id else {
            return Err(AppError::NotFound("post"));
        };

        let previous: Option<String> = sqlx::query_scalar(
            "SELECT kind FROM post_reactions WHERE post_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(post_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let previous = previous
            .map(|k| k.parse::<ReactionKind>())
            .transpose()?;

        let current = if previous == Some(kind) {
            sqlx::query("DELETE FROM post_reactions WHERE post_id = $1 AND user_id = $2")
                .bind(post_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            None
        } else {
            sqlx::query(
                r#"
                INSERT INTO post_reactions (post_id, user_id, kind, reacted_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (post_id, user_id) DO UPDATE
                    SET kind = EXCLUDED.kind, reacted_at = EXCLUDED.reacted_at
                "#,
            )
            .bind(post_id)
            .bind(user_id)
            .bind(kind.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await?;
            Some(kind)
        };
        tx.commit().await?;

        self.publish(Collection::Reactions, &group_id, post_id);
        Ok(ToggleOutcome { previous, current })
    }

    async fn list_reactions(&self, post_id: &str) -> AppResult<Vec<Reaction>> {
        let rows: Vec<ReactionRow> = sqlx::query_as(
            "SELECT post_id, user_id, kind, reacted_at FROM post_reactions \
             WHERE post_id = $1 ORDER BY reacted_at",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Reaction {
                    post_id: row.post_id,
                    user_id: row.user_id,
                    kind: row.kind.parse()?,
                    reacted_at: row.reacted_at,
                })
            })
            .collect()
    }

    async fn insert_comment(&self, comment: &Comment) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let bumped = sqlx::query(
            "UPDATE posts SET comments_count = comments_count + 1 WHERE post_id = $1",
        )
        .bind(&comment.post_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if bumped == 0 {
            return Err(AppError::NotFound("post"));
        }
        sqlx::query(&format!(
            "INSERT INTO post_comments ({COMMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(&comment.comment_id)
        .bind(&comment.post_id)
        .bind(&comment.group_id)
        .bind(&comment.author_id)
        .bind(&comment.author_name)
        .bind(&comment.content)
        .bind(comment.created_at)
        .bind(comment.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.publish(Collection::Comments, &comment.group_id, &comment.comment_id);
        Ok(())
    }

    async fn get_comment(&self, comment_id: &str) -> AppResult<Option<Comment>> {
        let row: Option<CommentRow> = sqlx::query_as(&format!(
            "SELECT {COMMENT_COLUMNS} FROM post_comments WHERE comment_id = $1"
        ))
        .bind(comment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Comment::from))
    }

    async fn list_comments(&self, post_id: &str) -> AppResult<Vec<Comment>> {
        let rows: Vec<CommentRow> = sqlx::query_as(&format!(
            "SELECT {COMMENT_COLUMNS} FROM post_comments WHERE post_id = $1 ORDER BY created_at"
        ))
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Comment::from).collect())
    }

    async fn delete_comment(&self, comment_id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted: Option<(String, String)> = sqlx::query_as(
            "DELETE FROM post_comments WHERE comment_id = $1 RETURNING post_id, group_id",
        )
        .bind(comment_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((post_id, _)) = &deleted {
            sqlx::query(
                "UPDATE posts SET comments_count = GREATEST(comments_count - 1, 0) \
                 WHERE post_id = $1",
            )
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        match deleted {
            Some((_, group_id)) => {
                self.publish(Collection::Comments, &group_id, comment_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_message(&self, message: &ChatMessage) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO chat_messages ({MESSAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(&message.message_id)
        .bind(&message.event_id)
        .bind(&message.author_id)
        .bind(&message.author_name)
        .bind(&message.content)
        .bind(message.status.as_str())
        .bind(message.is_organizer)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        self.publish(Collection::Messages, &message.event_id, &message.message_id);
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> AppResult<Option<ChatMessage>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_message(&mut *conn, message_id).await
    }

    async fn list_messages(&self, event_id: &str) -> AppResult<Vec<ChatMessage>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE event_id = $1 ORDER BY created_at"
        ))
        .bind(event_id)
        .fetch_all(&mut *conn)
        .await?;
        let ids: Vec<String> = rows.iter().map(|r| r.message_id.clone()).collect();
        let mut reports = Self::reports_for(&mut *conn, &ids).await?;
        rows.into_iter()
            .map(|row| {
                let attached = reports.remove(&row.message_id).unwrap_or_default();
                message_from_row(row, attached)
            })
            .collect()
    }

    async fn set_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> AppResult<bool> {
        let event_id: Option<String> = sqlx::query_scalar(
            "UPDATE chat_messages SET status = $2 WHERE message_id = $1 RETURNING event_id",
        )
        .bind(message_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match event_id {
            Some(event_id) => {
                self.publish(Collection::Messages, &event_id, message_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_message(&self, message_id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM message_reports WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        let event_id: Option<String> =
            sqlx::query_scalar("DELETE FROM chat_messages WHERE message_id = $1 RETURNING event_id")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        match event_id {
            Some(event_id) => {
                self.publish(Collection::Messages, &event_id, message_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_report(&self, message_id: &str, report: &Report) -> AppResult<ReportOutcome> {
        let mut tx = self.pool.begin().await?;
        let locked: Option<String> = sqlx::query_scalar(
            "SELECT event_id FROM chat_messages WHERE message_id = $1 FOR UPDATE",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(event_id) = locked else {
            return Err(AppError::NotFound("message"));
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO message_reports (message_id, reporter_id, reason, description, reported_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (message_id, reporter_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(&report.reporter_id)
        .bind(report.reason.as_str())
        .bind(report.description.as_deref())
        .bind(report.reported_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if !inserted {
            return Ok(ReportOutcome::Duplicate);
        }

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message_reports WHERE message_id = $1")
                .bind(message_id)
                .fetch_one(&mut *tx)
                .await?;
        if total as usize >= REPORT_THRESHOLD {
            sqlx::query("UPDATE chat_messages SET status = $2 WHERE message_id = $1")
                .bind(message_id)
                .bind(MessageStatus::Reported.as_str())
                .execute(&mut *tx)
                .await?;
        }
        let message = Self::load_message(&mut *tx, message_id)
            .await?
            .ok_or(AppError::NotFound("message"))?;
        tx.commit().await?;

        self.publish(Collection::Messages, &event_id, message_id);
        Ok(ReportOutcome::Added(message))
    }

    async fn get_profile(&self, uid: &str) -> AppResult<Option<UserProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT uid, display_name, age, favorite_sports, skill_levels, location, updated_at \
             FROM user_profiles WHERE uid = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| UserProfile {
            uid: row.uid,
            display_name: row.display_name,
            age: row.age.and_then(|a| u32::try_from(a).ok()),
            favorite_sports: row.favorite_sports.0,
            skill_levels: row.skill_levels.0,
            location: row.location,
            updated_at: row.updated_at,
        }))
    }

    async fn put_profile(&self, profile: &UserProfile) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (
                uid, display_name, age, favorite_sports, skill_levels, location, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (uid) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                age = EXCLUDED.age,
                favorite_sports = EXCLUDED.favorite_sports,
                skill_levels = EXCLUDED.skill_levels,
                location = EXCLUDED.location,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&profile.uid)
        .bind(&profile.display_name)
        .bind(profile.age.map(|a| a as i32))
        .bind(Json(&profile.favorite_sports))
        .bind(Json(&profile.skill_levels))
        .bind(profile.location.as_deref())
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn reconcile(&self) -> AppResult<ReconcileReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = ReconcileReport::default();

        let orphan_sweeps = [
            "DELETE FROM group_members WHERE group_id NOT IN (SELECT group_id FROM groups)",
            "DELETE FROM membership_requests WHERE group_id NOT IN (SELECT group_id FROM groups)",
            "DELETE FROM chat_messages WHERE event_id NOT IN (SELECT group_id FROM groups)",
            "DELETE FROM message_reports \
             WHERE message_id NOT IN (SELECT message_id FROM chat_messages)",
            "DELETE FROM posts WHERE group_id NOT IN (SELECT group_id FROM groups)",
            "DELETE FROM post_comments WHERE post_id NOT IN (SELECT post_id FROM posts)",
            "DELETE FROM post_reactions WHERE post_id NOT IN (SELECT post_id FROM posts)",
        ];
        for sweep in orphan_sweeps {
            report.orphans_removed += sqlx::query(sweep).execute(&mut *tx).await?.rows_affected()
                as usize;
        }

        let fixed_groups: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE groups g SET member_count = counted.total
            FROM (
                SELECT g2.group_id, COUNT(m.user_id) FILTER (WHERE m.status = 'active') AS total
                FROM groups g2
                LEFT JOIN group_members m ON m.group_id = g2.group_id
                GROUP BY g2.group_id
            ) counted
            WHERE g.group_id = counted.group_id AND g.member_count <> counted.total
            RETURNING g.group_id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        report.member_counts_fixed = fixed_groups.len();

        report.comment_counts_fixed = sqlx::query(
            r#"
            UPDATE posts p SET comments_count = counted.total
            FROM (
                SELECT p2.post_id, COUNT(c.comment_id) AS total
                FROM posts p2
                LEFT JOIN post_comments c ON c.post_id = p2.post_id
                GROUP BY p2.post_id
            ) counted
            WHERE p.post_id = counted.post_id AND p.comments_count <> counted.total
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        let checked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM groups")
            .fetch_one(&mut *tx)
            .await?;
        report.groups_checked = checked as usize;
        tx.commit().await?;

        for group_id in &fixed_groups {
            self.invalidate_group(group_id).await;
        }
        Ok(report)
    }
}
