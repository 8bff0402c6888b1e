use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};

use super::{
    CHANGE_CHANNEL_CAPACITY, ChangeEvent, Collection, GroupQuery, ReconcileReport, Store,
    ToggleOutcome,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    ChatMessage, Comment, Group, Member, MemberStatus, MembershipRequest, MessageStatus, Post,
    REPORT_THRESHOLD, Reaction, ReactionKind, Report, ReportOutcome, RequestStatus, Resolution,
    ResolveOutcome, Role, UserProfile,
};

type PairKey = (String, String);

#[derive(Default)]
struct Tables {
    groups: HashMap<String, Group>,
    members: BTreeMap<PairKey, Member>,
    requests: HashMap<String, MembershipRequest>,
    posts: HashMap<String, Post>,
    reactions: BTreeMap<PairKey, Reaction>,
    comments: HashMap<String, Comment>,
    messages: HashMap<String, ChatMessage>,
    profiles: HashMap<String, UserProfile>,
}

impl Tables {
    fn is_active(&self, member: &Member) -> bool {
        self.members
            .get(&(member.group_id.clone(), member.user_id.clone()))
            .is_some_and(Member::is_active)
    }

    /// Capacity is checked against the live counter, under the same lock
    /// as the insert.
    fn ensure_room(&self, member: &Member) -> AppResult<()> {
        let full = !self.is_active(member)
            && self
                .groups
                .get(&member.group_id)
                .is_some_and(Group::is_full);
        if full {
            return Err(AppError::GroupFull);
        }
        Ok(())
    }

    fn admit(&mut self, member: &Member) -> AppResult<bool> {
        if self.is_active(member) {
            return Ok(false);
        }
        self.ensure_room(member)?;
        let key = (member.group_id.clone(), member.user_id.clone());
        let mut row = member.clone();
        row.status = MemberStatus::Active;
        self.members.insert(key, row);
        if let Some(group) = self.groups.get_mut(&member.group_id) {
            group.stats.member_count += 1;
        }
        Ok(true)
    }

    fn drop_active(&mut self, group_id: &str) {
        if let Some(group) = self.groups.get_mut(group_id) {
            group.stats.member_count = group.stats.member_count.saturating_sub(1);
        }
    }

    fn purge_post(&mut self, post_id: &str) -> usize {
        let before = self.comments.len() + self.reactions.len();
        self.comments.retain(|_, c| c.post_id != post_id);
        self.reactions.retain(|(p, _), _| p != post_id);
        before - (self.comments.len() + self.reactions.len())
    }
}

/// In-process store holding every table behind one lock; each operation is
/// a single critical section.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            changes,
        }
    }

    fn publish(&self, collection: Collection, group_id: &str, entity_id: &str) {
        // No subscribers is fine
        let _ = self
            .changes
            .send(ChangeEvent::new(collection, group_id, entity_id));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_group(&self, group: &Group, owner: &Member) -> AppResult<()> {
        {
            let mut t = self.tables.write().await;
            let mut row = group.clone();
            row.stats.member_count = 0;
            t.groups.insert(row.group_id.clone(), row);
            t.admit(owner)?;
        }
        self.publish(Collection::Groups, &group.group_id, &group.group_id);
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> AppResult<Option<Group>> {
        Ok(self.tables.read().await.groups.get(group_id).cloned())
    }

    async fn list_groups(&self, query: &GroupQuery) -> AppResult<Vec<Group>> {
        let t = self.tables.read().await;
        let mut groups: Vec<Group> = t
            .groups
            .values()
            .filter(|g| query.kind.is_none_or(|k| g.kind == k))
            .filter(|g| {
                query.member_id.as_ref().is_none_or(|uid| {
                    t.members
                        .get(&(g.group_id.clone(), uid.clone()))
                        .is_some_and(Member::is_active)
                })
            })
            .cloned()
            .collect();
        groups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.group_id.cmp(&b.group_id))
        });
        if let Some(limit) = query.limit {
            groups.truncate(limit);
        }
        Ok(groups)
    }

    async fn update_group(&self, group: &Group) -> AppResult<()> {
        {
            let mut t = self.tables.write().await;
            if let Some(existing) = t.groups.get_mut(&group.group_id) {
                let stats = existing.stats;
                *existing = group.clone();
                existing.stats = stats;
            }
        }
        self.publish(Collection::Groups, &group.group_id, &group.group_id);
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> AppResult<bool> {
        let removed = {
            let mut t = self.tables.write().await;
            if t.groups.remove(group_id).is_none() {
                return Ok(false);
            }
            t.members.retain(|(g, _), _| g != group_id);
            t.requests.retain(|_, r| r.group_id != group_id);
            let post_ids: Vec<String> = t
                .posts
                .values()
                .filter(|p| p.group_id == group_id)
                .map(|p| p.post_id.clone())
                .collect();
            for post_id in &post_ids {
                t.posts.remove(post_id);
                t.purge_post(post_id);
            }
            t.messages.retain(|_, m| m.event_id != group_id);
            true
        };
        self.publish(Collection::Groups, group_id, group_id);
        Ok(removed)
    }

    async fn get_member(&self, group_id: &str, user_id: &str) -> AppResult<Option<Member>> {
        let t = self.tables.read().await;
        Ok(t.members
            .get(&(group_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn list_members(&self, group_id: &str) -> AppResult<Vec<Member>> {
        let t = self.tables.read().await;
        let mut members: Vec<Member> = t
            .members
            .values()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(members)
    }

    async fn add_member(&self, member: &Member) -> AppResult<bool> {
        let added = self.tables.write().await.admit(member)?;
        if added {
            self.publish(Collection::Members, &member.group_id, &member.user_id);
        }
        Ok(added)
    }

    async fn remove_member(&self, group_id: &str, user_id: &str) -> AppResult<bool> {
        let removed = {
            let mut t = self.tables.write().await;
            match t
                .members
                .remove(&(group_id.to_string(), user_id.to_string()))
            {
                Some(m) => {
                    if m.is_active() {
                        t.drop_active(group_id);
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
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
        let changed = {
            let mut t = self.tables.write().await;
            let key = (group_id.to_string(), user_id.to_string());
            let previous = match t.members.get_mut(&key) {
                Some(m) if m.status != status => {
                    let previous = m.status;
                    m.status = status;
                    Some(previous)
                }
                _ => None,
            };
            match previous {
                Some(MemberStatus::Active) => t.drop_active(group_id),
                Some(MemberStatus::Removed) => {
                    if let Some(g) = t.groups.get_mut(group_id) {
                        g.stats.member_count += 1;
                    }
                }
                None => {}
            }
            previous.is_some()
        };
        if changed {
            self.publish(Collection::Members, group_id, user_id);
        }
        Ok(changed)
    }

    async fn set_member_role(&self, group_id: &str, user_id: &str, role: Role) -> AppResult<bool> {
        let changed = {
            let mut t = self.tables.write().await;
            match t
                .members
                .get_mut(&(group_id.to_string(), user_id.to_string()))
            {
                Some(m) => {
                    m.role = role;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.publish(Collection::Members, group_id, user_id);
        }
        Ok(changed)
    }

    async fn insert_request(&self, request: &MembershipRequest) -> AppResult<bool> {
        {
            let mut t = self.tables.write().await;
            let pending_exists = t.requests.values().any(|r| {
                r.group_id == request.group_id
                    && r.user_id == request.user_id
                    && r.status == RequestStatus::Pending
            });
            if pending_exists {
                return Ok(false);
            }
            t.requests
                .insert(request.request_id.clone(), request.clone());
        }
        self.publish(Collection::Requests, &request.group_id, &request.request_id);
        Ok(true)
    }

    async fn get_request(&self, request_id: &str) -> AppResult<Option<MembershipRequest>> {
        Ok(self.tables.read().await.requests.get(request_id).cloned())
    }

    async fn find_pending_request(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> AppResult<Option<MembershipRequest>> {
        let t = self.tables.read().await;
        Ok(t.requests
            .values()
            .find(|r| {
                r.group_id == group_id && r.user_id == user_id && r.status == RequestStatus::Pending
            })
            .cloned())
    }

    async fn list_requests(
        &self,
        group_id: &str,
        status: Option<RequestStatus>,
    ) -> AppResult<Vec<MembershipRequest>> {
        let t = self.tables.read().await;
        let mut requests: Vec<MembershipRequest> = t
            .requests
            .values()
            .filter(|r| r.group_id == group_id && status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(requests)
    }

    async fn resolve_request(
        &self,
        request_id: &str,
        resolution: &Resolution,
        admit: Option<&Member>,
    ) -> AppResult<ResolveOutcome> {
        let (outcome, group_id) = {
            let mut t = self.tables.write().await;
            match t.requests.get(request_id) {
                None => return Err(AppError::NotFound("request")),
                Some(request) if request.status != RequestStatus::Pending => {
                    return Ok(ResolveOutcome::AlreadyResolved(request.clone()));
                }
                Some(_) => {}
            }
            // refuse before touching the request so it stays pending
            if let Some(member) = admit {
                t.ensure_room(member)?;
            }
            let Some(request) = t.requests.get_mut(request_id) else {
                return Err(AppError::NotFound("request"));
            };
            request.status = resolution.status;
            request.reviewed_by = Some(resolution.reviewer_id.clone());
            request.responded_at = Some(resolution.responded_at);
            request.rejection_reason = resolution.reason.clone();
            let resolved = request.clone();
            if let Some(member) = admit {
                t.admit(member)?;
            }
            (ResolveOutcome::Resolved(resolved.clone()), resolved.group_id)
        };
        self.publish(Collection::Requests, &group_id, request_id);
        Ok(outcome)
    }

    async fn cancel_pending_request(&self, group_id: &str, user_id: &str) -> AppResult<bool> {
        let cancelled = {
            let mut t = self.tables.write().await;
            let before = t.requests.len();
            t.requests.retain(|_, r| {
                !(r.group_id == group_id
                    && r.user_id == user_id
                    && r.status == RequestStatus::Pending)
            });
            before != t.requests.len()
        };
        if cancelled {
            self.publish(Collection::Requests, group_id, user_id);
        }
        Ok(cancelled)
    }

    async fn insert_post(&self, post: &Post) -> AppResult<()> {
        self.tables
            .write()
            .await
            .posts
            .insert(post.post_id.clone(), post.clone());
        self.publish(Collection::Posts, &post.group_id, &post.post_id);
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> AppResult<Option<Post>> {
        Ok(self.tables.read().await.posts.get(post_id).cloned())
    }

    async fn list_posts(&self, group_id: &str) -> AppResult<Vec<Post>> {
        let t = self.tables.read().await;
        let mut posts: Vec<Post> = t
            .posts
            .values()
            .filter(|p| p.group_id == group_id)
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts)
    }

    async fn set_post_pinned(&self, post_id: &str, pinned: bool) -> AppResult<bool> {
        let group_id = {
            let mut t = self.tables.write().await;
            match t.posts.get_mut(post_id) {
                Some(p) => {
                    p.pinned = pinned;
                    p.updated_at = Utc::now();
                    p.group_id.clone()
                }
                None => return Ok(false),
            }
        };
        self.publish(Collection::Posts, &group_id, post_id);
        Ok(true)
    }

    async fn delete_post(&self, post_id: &str) -> AppResult<bool> {
        let group_id = {
            let mut t = self.tables.write().await;
            match t.posts.remove(post_id) {
                Some(p) => {
                    t.purge_post(post_id);
                    p.group_id
                }
                None => return Ok(false),
            }
        };
        self.publish(Collection::Posts, &group_id, post_id);
        Ok(true)
    }

    async fn toggle_reaction(
        &self,
        post_id: &str,
        user_id: &str,
        kind: ReactionKind,
        at: DateTime<Utc>,
    ) -> AppResult<ToggleOutcome> {
        let (outcome, group_id) = {
            let mut t = self.tables.write().await;
            let group_id = match t.posts.get(post_id) {
                Some(p) => p.group_id.clone(),
                None => return Err(AppError::NotFound("post")),
            };
            let key = (post_id.to_string(), user_id.to_string());
            let previous = t.reactions.get(&key).map(|r| r.kind);
            let current = if previous == Some(kind) {
                t.reactions.remove(&key);
                None
            } else {
                t.reactions.insert(
                    key,
                    Reaction {
                        post_id: post_id.to_string(),
                        user_id: user_id.to_string(),
                        kind,
                        reacted_at: at,
                    },
                );
                Some(kind)
            };
            (ToggleOutcome { previous, current }, group_id)
        };
        self.publish(Collection::Reactions, &group_id, post_id);
        Ok(outcome)
    }

    async fn list_reactions(&self, post_id: &str) -> AppResult<Vec<Reaction>> {
        let t = self.tables.read().await;
        Ok(t.reactions
            .values()
            .filter(|r| r.post_id == post_id)
            .cloned()
            .collect())
    }

    async fn insert_comment(&self, comment: &Comment) -> AppResult<()> {
        {
            let mut t = self.tables.write().await;
            let Some(post) = t.posts.get_mut(&comment.post_id) else {
                return Err(AppError::NotFound("post"));
            };
            post.comments_count += 1;
            t.comments
                .insert(comment.comment_id.clone(), comment.clone());
        }
        self.publish(Collection::Comments, &comment.group_id, &comment.comment_id);
        Ok(())
    }

    async fn get_comment(&self, comment_id: &str) -> AppResult<Option<Comment>> {
        Ok(self.tables.read().await.comments.get(comment_id).cloned())
    }

    async fn list_comments(&self, post_id: &str) -> AppResult<Vec<Comment>> {
        let t = self.tables.read().await;
        let mut comments: Vec<Comment> = t
            .comments
            .values()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }

    async fn delete_comment(&self, comment_id: &str) -> AppResult<bool> {
        let comment = {
            let mut t = self.tables.write().await;
            let Some(comment) = t.comments.remove(comment_id) else {
                return Ok(false);
            };
            if let Some(post) = t.posts.get_mut(&comment.post_id) {
                post.comments_count = post.comments_count.saturating_sub(1);
            }
            comment
        };
        self.publish(Collection::Comments, &comment.group_id, comment_id);
        Ok(true)
    }

    async fn insert_message(&self, message: &ChatMessage) -> AppResult<()> {
        self.tables
            .write()
            .await
            .messages
            .insert(message.message_id.clone(), message.clone());
        self.publish(Collection::Messages, &message.event_id, &message.message_id);
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> AppResult<Option<ChatMessage>> {
        Ok(self.tables.read().await.messages.get(message_id).cloned())
    }

    async fn list_messages(&self, event_id: &str) -> AppResult<Vec<ChatMessage>> {
        let t = self.tables.read().await;
        let mut messages: Vec<ChatMessage> = t
            .messages
            .values()
            .filter(|m| m.event_id == event_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn set_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> AppResult<bool> {
        let event_id = {
            let mut t = self.tables.write().await;
            match t.messages.get_mut(message_id) {
                Some(m) => {
                    m.status = status;
                    m.event_id.clone()
                }
                None => return Ok(false),
            }
        };
        self.publish(Collection::Messages, &event_id, message_id);
        Ok(true)
    }

    async fn delete_message(&self, message_id: &str) -> AppResult<bool> {
        let removed = self.tables.write().await.messages.remove(message_id);
        match removed {
            Some(m) => {
                self.publish(Collection::Messages, &m.event_id, message_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_report(&self, message_id: &str, report: &Report) -> AppResult<ReportOutcome> {
        let message = {
            let mut t = self.tables.write().await;
            let Some(message) = t.messages.get_mut(message_id) else {
                return Err(AppError::NotFound("message"));
            };
            if message
                .reports
                .iter()
                .any(|r| r.reporter_id == report.reporter_id)
            {
                return Ok(ReportOutcome::Duplicate);
            }
            message.reports.push(report.clone());
            if message.reports.len() >= REPORT_THRESHOLD {
                message.status = MessageStatus::Reported;
            }
            message.clone()
        };
        self.publish(Collection::Messages, &message.event_id, message_id);
        Ok(ReportOutcome::Added(message))
    }

    async fn get_profile(&self, uid: &str) -> AppResult<Option<UserProfile>> {
        Ok(self.tables.read().await.profiles.get(uid).cloned())
    }

    async fn put_profile(&self, profile: &UserProfile) -> AppResult<()> {
        self.tables
            .write()
            .await
            .profiles
            .insert(profile.uid.clone(), profile.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn reconcile(&self) -> AppResult<ReconcileReport> {
        let mut t = self.tables.write().await;
        let mut report = ReconcileReport::default();
        let group_ids: HashSet<String> = t.groups.keys().cloned().collect();

        let before = t.members.len() + t.requests.len() + t.messages.len();
        t.members.retain(|(g, _), _| group_ids.contains(g));
        t.requests.retain(|_, r| group_ids.contains(&r.group_id));
        t.messages.retain(|_, m| group_ids.contains(&m.event_id));
        report.orphans_removed += before - (t.members.len() + t.requests.len() + t.messages.len());

        let orphan_posts: Vec<String> = t
            .posts
            .values()
            .filter(|p| !group_ids.contains(&p.group_id))
            .map(|p| p.post_id.clone())
            .collect();
        for post_id in &orphan_posts {
            t.posts.remove(post_id);
            report.orphans_removed += 1;
        }
        let post_ids: HashSet<String> = t.posts.keys().cloned().collect();
        let before = t.comments.len() + t.reactions.len();
        t.comments.retain(|_, c| post_ids.contains(&c.post_id));
        t.reactions.retain(|(p, _), _| post_ids.contains(p));
        report.orphans_removed += before - (t.comments.len() + t.reactions.len());

        let mut active: HashMap<String, u32> = HashMap::new();
        for m in t.members.values().filter(|m| m.is_active()) {
            *active.entry(m.group_id.clone()).or_default() += 1;
        }
        for group in t.groups.values_mut() {
            report.groups_checked += 1;
            let actual = active.get(&group.group_id).copied().unwrap_or(0);
            if group.stats.member_count != actual {
                group.stats.member_count = actual;
                report.member_counts_fixed += 1;
            }
        }

        let mut comment_totals: HashMap<String, u32> = HashMap::new();
        for c in t.comments.values() {
            *comment_totals.entry(c.post_id.clone()).or_default() += 1;
        }
        for post in t.posts.values_mut() {
            let actual = comment_totals.get(&post.post_id).copied().unwrap_or(0);
            if post.comments_count != actual {
                post.comments_count = actual;
                report.comment_counts_fixed += 1;
            }
        }

        Ok(report)
    }
}

impl MemoryStore {
    /// Overwrites the stored member counter, bypassing the workflow. Used to
    /// reproduce drift left behind by older clients.
    pub async fn force_member_count(&self, group_id: &str, count: u32) {
        if let Some(g) = self.tables.write().await.groups.get_mut(group_id) {
            g.stats.member_count = count;
        }
    }
}
