//! Entity store adapter.
//!
//! Every sub-collection (members, requests, reactions, reports) is keyed on
//! its own compound key, so a write touches one element instead of rewriting
//! a whole list. Denormalized counters move inside the same atomic unit as
//! the element they count.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::AppResult;
use crate::models::{
    ChatMessage, Comment, Group, GroupKind, Member, MemberStatus, MembershipRequest,
    MessageStatus, Post, Reaction, ReactionKind, Report, ReportOutcome, RequestStatus,
    Resolution, ResolveOutcome, Role, UserProfile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Groups,
    Members,
    Requests,
    Posts,
    Comments,
    Reactions,
    Messages,
}

/// Published after every committed write, scoped to the owning group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub group_id: String,
    pub entity_id: String,
}

impl ChangeEvent {
    pub fn new(collection: Collection, group_id: &str, entity_id: &str) -> Self {
        Self {
            collection,
            group_id: group_id.to_string(),
            entity_id: entity_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupQuery {
    pub kind: Option<GroupKind>,
    /// Only groups where this user is an active member.
    pub member_id: Option<String>,
    pub limit: Option<usize>,
}

/// Result of a single reaction toggle: the kind the user now holds, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub previous: Option<ReactionKind>,
    pub current: Option<ReactionKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub groups_checked: usize,
    pub member_counts_fixed: usize,
    pub comment_counts_fixed: usize,
    pub orphans_removed: usize,
}

pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts the group together with its owner as the first active member.
    async fn insert_group(&self, group: &Group, owner: &Member) -> AppResult<()>;
    async fn get_group(&self, group_id: &str) -> AppResult<Option<Group>>;
    async fn list_groups(&self, query: &GroupQuery) -> AppResult<Vec<Group>>;
    /// Overwrites descriptive fields and settings; counters are left alone.
    async fn update_group(&self, group: &Group) -> AppResult<()>;
    /// Deletes the group and every dependent record in one unit.
    async fn delete_group(&self, group_id: &str) -> AppResult<bool>;

    async fn get_member(&self, group_id: &str, user_id: &str) -> AppResult<Option<Member>>;
    async fn list_members(&self, group_id: &str) -> AppResult<Vec<Member>>;
    /// Makes the member active and bumps the counter. Returns `false` when
    /// the user already was an active member (counter untouched).
    async fn add_member(&self, member: &Member) -> AppResult<bool>;
    /// Deletes the membership row; the counter drops only if it was active.
    async fn remove_member(&self, group_id: &str, user_id: &str) -> AppResult<bool>;
    async fn set_member_status(
        &self,
        group_id: &str,
        user_id: &str,
        status: MemberStatus,
    ) -> AppResult<bool>;
    async fn set_member_role(&self, group_id: &str, user_id: &str, role: Role) -> AppResult<bool>;

    /// Inserts the request unless a pending one exists for the same
    /// `(group, user)`; returns `false` in that case.
    async fn insert_request(&self, request: &MembershipRequest) -> AppResult<bool>;
    async fn get_request(&self, request_id: &str) -> AppResult<Option<MembershipRequest>>;
    async fn find_pending_request(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> AppResult<Option<MembershipRequest>>;
    async fn list_requests(
        &self,
        group_id: &str,
        status: Option<RequestStatus>,
    ) -> AppResult<Vec<MembershipRequest>>;
    /// Moves a pending request to its terminal state. When `admit` is set the
    /// member is added in the same unit.
    async fn resolve_request(
        &self,
        request_id: &str,
        resolution: &Resolution,
        admit: Option<&Member>,
    ) -> AppResult<ResolveOutcome>;
    async fn cancel_pending_request(&self, group_id: &str, user_id: &str) -> AppResult<bool>;

    async fn insert_post(&self, post: &Post) -> AppResult<()>;
    async fn get_post(&self, post_id: &str) -> AppResult<Option<Post>>;
    async fn list_posts(&self, group_id: &str) -> AppResult<Vec<Post>>;
    async fn set_post_pinned(&self, post_id: &str, pinned: bool) -> AppResult<bool>;
    async fn delete_post(&self, post_id: &str) -> AppResult<bool>;

    /// Same kind removes the reaction, any other kind replaces it.
    async fn toggle_reaction(
        &self,
        post_id: &str,
        user_id: &str,
        kind: ReactionKind,
        at: DateTime<Utc>,
    ) -> AppResult<ToggleOutcome>;
    async fn list_reactions(&self, post_id: &str) -> AppResult<Vec<Reaction>>;

    /// Inserts the comment and increments the post counter atomically.
    async fn insert_comment(&self, comment: &Comment) -> AppResult<()>;
    async fn get_comment(&self, comment_id: &str) -> AppResult<Option<Comment>>;
    async fn list_comments(&self, post_id: &str) -> AppResult<Vec<Comment>>;
    async fn delete_comment(&self, comment_id: &str) -> AppResult<bool>;

    async fn insert_message(&self, message: &ChatMessage) -> AppResult<()>;
    async fn get_message(&self, message_id: &str) -> AppResult<Option<ChatMessage>>;
    async fn list_messages(&self, event_id: &str) -> AppResult<Vec<ChatMessage>>;
    async fn set_message_status(&self, message_id: &str, status: MessageStatus)
    -> AppResult<bool>;
    async fn delete_message(&self, message_id: &str) -> AppResult<bool>;
    /// Adds the report unless the reporter already reported this message.
    /// Reaching the report threshold moves the message to `reported`.
    async fn add_report(&self, message_id: &str, report: &Report) -> AppResult<ReportOutcome>;

    async fn get_profile(&self, uid: &str) -> AppResult<Option<UserProfile>>;
    async fn put_profile(&self, profile: &UserProfile) -> AppResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Recomputes counters and removes dependents whose parent is gone.
    /// Safe to run repeatedly.
    async fn reconcile(&self) -> AppResult<ReconcileReport>;
}
