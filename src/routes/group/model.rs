use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Answer, EventDetails, Group, GroupKind, GroupSettings, GroupStats, Member, MemberStatus,
    MembershipRequest, RequestStatus, Resolution, ResolveOutcome, Role,
};
use crate::notify::{Notification, Notifier};
use crate::store::{GroupQuery, Store};
use crate::utils::Identity;

const MAX_NAME_LEN: usize = 120;
const MAX_ANSWER_LEN: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    #[serde(default = "default_kind")]
    pub kind: GroupKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: GroupSettings,
    pub event: Option<EventDetails>,
}

fn default_kind() -> GroupKind {
    GroupKind::Group
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateGroupRequest {
    pub group_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub settings: Option<GroupSettings>,
    pub event: Option<EventDetails>,
}

#[derive(Debug, Deserialize)]
pub struct JoinGroupRequest {
    pub group_id: String,
    #[serde(default)]
    pub answers: Vec<Answer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn target_status(self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub request_id: String,
    pub decision: Decision,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemberTarget {
    pub group_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub group_id: String,
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "lowercase")]
pub enum JoinOutcome {
    /// Open group: the user is an active member now.
    Joined(Member),
    /// Approval required: a pending request was filed.
    Pending(MembershipRequest),
}

#[derive(Debug, Serialize)]
pub struct GroupInfo {
    #[serde(flatten)]
    pub group: Group,
    /// Caller's role, when they are an active member.
    pub my_role: Option<Role>,
    pub has_pending_request: bool,
}

pub(crate) async fn load_group(store: &dyn Store, group_id: &str) -> AppResult<Group> {
    store
        .get_group(group_id)
        .await?
        .ok_or(AppError::NotFound("group"))
}

/// The caller's effective role: the owner always counts as `Owner`, anyone
/// else needs an active membership.
pub(crate) async fn role_in(store: &dyn Store, group: &Group, uid: &str) -> AppResult<Option<Role>> {
    if group.owner_id == uid {
        return Ok(Some(Role::Owner));
    }
    Ok(store
        .get_member(&group.group_id, uid)
        .await?
        .filter(Member::is_active)
        .map(|m| m.role))
}

pub(crate) async fn require_member(store: &dyn Store, group: &Group, uid: &str) -> AppResult<Role> {
    role_in(store, group, uid).await?.ok_or(AppError::NotAMember)
}

/// Private groups expose their content to members only.
pub(crate) async fn require_reader(store: &dyn Store, group: &Group, uid: &str) -> AppResult<()> {
    use crate::models::Visibility;
    if group.settings.visibility == Visibility::Public {
        return Ok(());
    }
    require_member(store, group, uid).await.map(|_| ())
}

fn validate_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn validate_settings(settings: &GroupSettings) -> AppResult<()> {
    if settings.max_members == Some(0) {
        return Err(AppError::Validation("max_members must be at least 1".into()));
    }
    if let (Some(min), Some(max)) = (settings.min_age, settings.max_age) {
        if min > max {
            return Err(AppError::Validation("min_age exceeds max_age".into()));
        }
    }
    let mut seen = HashSet::new();
    for q in &settings.questions {
        if q.id.trim().is_empty() || q.text.trim().is_empty() {
            return Err(AppError::Validation("questions need an id and a text".into()));
        }
        if !seen.insert(q.id.as_str()) {
            return Err(AppError::Validation(format!("duplicate question id {}", q.id)));
        }
    }
    Ok(())
}

fn validate_event(kind: GroupKind, event: &Option<EventDetails>) -> AppResult<()> {
    match (kind, event) {
        (GroupKind::Event, None) => Err(AppError::Validation("events need event details".into())),
        (GroupKind::Event, Some(e)) if e.sport.trim().is_empty() => {
            Err(AppError::Validation("event sport must not be empty".into()))
        }
        (GroupKind::Group, Some(_)) => Err(AppError::Validation(
            "event details are only allowed on events".into(),
        )),
        _ => Ok(()),
    }
}

/// Checks answers against the admission questions: no unknown ids, every
/// required question answered.
fn validate_answers(settings: &GroupSettings, answers: &[Answer]) -> AppResult<()> {
    for a in answers {
        if !settings.questions.iter().any(|q| q.id == a.question_id) {
            return Err(AppError::Validation(format!("unknown question {}", a.question_id)));
        }
        if a.answer.chars().count() > MAX_ANSWER_LEN {
            return Err(AppError::Validation("answer is too long".into()));
        }
    }
    for q in settings.questions.iter().filter(|q| q.required) {
        let answered = answers
            .iter()
            .any(|a| a.question_id == q.id && !a.answer.trim().is_empty());
        if !answered {
            return Err(AppError::Validation(format!("question {} needs an answer", q.id)));
        }
    }
    Ok(())
}

async fn check_age(store: &dyn Store, settings: &GroupSettings, uid: &str) -> AppResult<()> {
    if settings.min_age.is_none() && settings.max_age.is_none() {
        return Ok(());
    }
    let Some(age) = store.get_profile(uid).await?.and_then(|p| p.age) else {
        return Ok(());
    };
    let too_young = settings.min_age.is_some_and(|min| age < min);
    let too_old = settings.max_age.is_some_and(|max| age > max);
    if too_young || too_old {
        return Err(AppError::AgeRestricted);
    }
    Ok(())
}

fn new_member(group_id: &str, identity: &Identity, role: Role) -> Member {
    Member {
        group_id: group_id.to_string(),
        user_id: identity.uid.clone(),
        display_name: identity.display_name.clone(),
        role,
        status: MemberStatus::Active,
        joined_at: Utc::now(),
    }
}

impl Group {
    pub async fn create(
        store: &dyn Store,
        owner: &Identity,
        req: CreateGroupRequest,
    ) -> AppResult<Self> {
        let name = validate_name(&req.name)?;
        validate_settings(&req.settings)?;
        validate_event(req.kind, &req.event)?;

        let now = Utc::now();
        let group = Group {
            group_id: Uuid::new_v4().to_string(),
            kind: req.kind,
            owner_id: owner.uid.clone(),
            name,
            description: req.description.trim().to_string(),
            settings: req.settings,
            event: req.event,
            stats: GroupStats { member_count: 1 },
            created_at: now,
            updated_at: now,
        };
        let owner_member = new_member(&group.group_id, owner, Role::Owner);
        store.insert_group(&group, &owner_member).await?;
        tracing::info!(
            "{} {} created by {}",
            group.kind.as_str(),
            group.group_id,
            owner.uid
        );
        Ok(group)
    }

    pub async fn info(store: &dyn Store, group_id: &str, caller: &Identity) -> AppResult<GroupInfo> {
        let group = load_group(store, group_id).await?;
        let my_role = role_in(store, &group, &caller.uid).await?;
        let has_pending_request = store
            .find_pending_request(group_id, &caller.uid)
            .await?
            .is_some();
        Ok(GroupInfo {
            group,
            my_role,
            has_pending_request,
        })
    }

    pub async fn list_mine(
        store: &dyn Store,
        caller: &Identity,
        kind: Option<GroupKind>,
    ) -> AppResult<Vec<Group>> {
        store
            .list_groups(&GroupQuery {
                kind,
                member_id: Some(caller.uid.clone()),
                limit: None,
            })
            .await
    }

    pub async fn update(
        store: &dyn Store,
        actor: &Identity,
        req: UpdateGroupRequest,
    ) -> AppResult<Self> {
        let mut group = load_group(store, &req.group_id).await?;
        let role = require_member(store, &group, &actor.uid).await?;
        if !role.can_manage_members() {
            return Err(AppError::PermissionDenied("only the owner or an admin can edit the group"));
        }

        if let Some(name) = req.name {
            group.name = validate_name(&name)?;
        }
        if let Some(description) = req.description {
            group.description = description.trim().to_string();
        }
        if let Some(settings) = req.settings {
            validate_settings(&settings)?;
            group.settings = settings;
        }
        if req.event.is_some() {
            validate_event(group.kind, &req.event)?;
            group.event = req.event;
        }
        group.updated_at = Utc::now();

        store.update_group(&group).await?;
        tracing::info!("Group {} updated by {}", group.group_id, actor.uid);
        load_group(store, &group.group_id).await
    }

    pub async fn delete(store: &dyn Store, actor: &Identity, group_id: &str) -> AppResult<()> {
        let group = load_group(store, group_id).await?;
        if group.owner_id != actor.uid {
            return Err(AppError::PermissionDenied("only the owner can delete the group"));
        }
        store.delete_group(group_id).await?;
        tracing::info!("Group {} deleted by {}", group_id, actor.uid);
        Ok(())
    }

    pub async fn request_to_join(
        store: &dyn Store,
        notifier: &Notifier,
        group_id: &str,
        user: &Identity,
        answers: Vec<Answer>,
    ) -> AppResult<JoinOutcome> {
        let group = load_group(store, group_id).await?;
        if role_in(store, &group, &user.uid).await?.is_some() {
            return Err(AppError::AlreadyMember);
        }
        if store.find_pending_request(group_id, &user.uid).await?.is_some() {
            return Err(AppError::DuplicateRequest);
        }
        if group.is_full() {
            return Err(AppError::GroupFull);
        }
        check_age(store, &group.settings, &user.uid).await?;

        if !group.settings.requires_approval {
            let member = new_member(group_id, user, Role::Member);
            if !store.add_member(&member).await? {
                return Err(AppError::AlreadyMember);
            }
            tracing::info!("User {} joined group {}", user.uid, group_id);
            return Ok(JoinOutcome::Joined(member));
        }

        validate_answers(&group.settings, &answers)?;
        let request = MembershipRequest {
            request_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            user_id: user.uid.clone(),
            requester_name: user.display_name.clone(),
            answers,
            status: RequestStatus::Pending,
            submitted_at: Utc::now(),
            responded_at: None,
            reviewed_by: None,
            rejection_reason: None,
        };
        if !store.insert_request(&request).await? {
            return Err(AppError::DuplicateRequest);
        }
        tracing::info!(
            "User {} requested to join group {} ({})",
            user.uid,
            group_id,
            request.request_id
        );
        notifier.dispatch(Notification {
            topic: format!("{}_organizers", Notifier::group_topic(group_id)),
            title: group.name.clone(),
            body: format!("{} wants to join", user.display_name),
        });
        Ok(JoinOutcome::Pending(request))
    }

    pub async fn respond_to_request(
        store: &dyn Store,
        request_id: &str,
        decision: Decision,
        reviewer: &Identity,
        reason: Option<String>,
    ) -> AppResult<MembershipRequest> {
        let request = store
            .get_request(request_id)
            .await?
            .ok_or(AppError::NotFound("request"))?;
        let group = load_group(store, &request.group_id).await?;
        let role = role_in(store, &group, &reviewer.uid).await?;
        if !role.is_some_and(Role::can_moderate) {
            return Err(AppError::PermissionDenied("only organizers can review requests"));
        }

        if request.status != RequestStatus::Pending {
            return settle_repeat(request, decision);
        }

        let admit = match decision {
            Decision::Approve => {
                let already_active = store
                    .get_member(&group.group_id, &request.user_id)
                    .await?
                    .is_some_and(|m| m.is_active());
                if group.is_full() && !already_active {
                    return Err(AppError::GroupFull);
                }
                Some(Member {
                    group_id: group.group_id.clone(),
                    user_id: request.user_id.clone(),
                    display_name: request.requester_name.clone(),
                    role: Role::Member,
                    status: MemberStatus::Active,
                    joined_at: Utc::now(),
                })
            }
            Decision::Reject => None,
        };
        let resolution = Resolution {
            status: decision.target_status(),
            reviewer_id: reviewer.uid.clone(),
            responded_at: Utc::now(),
            reason: match decision {
                Decision::Reject => reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
                Decision::Approve => None,
            },
        };

        match store
            .resolve_request(request_id, &resolution, admit.as_ref())
            .await?
        {
            ResolveOutcome::Resolved(resolved) => {
                tracing::info!(
                    "Request {} {} by {}",
                    request_id,
                    resolved.status.as_str(),
                    reviewer.uid
                );
                Ok(resolved)
            }
            // another reviewer got there first
            ResolveOutcome::AlreadyResolved(current) => settle_repeat(current, decision),
        }
    }

    pub async fn cancel_request(store: &dyn Store, group_id: &str, user: &Identity) -> AppResult<bool> {
        load_group(store, group_id).await?;
        let cancelled = store.cancel_pending_request(group_id, &user.uid).await?;
        if cancelled {
            tracing::info!("User {} withdrew the request for group {}", user.uid, group_id);
        }
        Ok(cancelled)
    }

    /// Leaving is a no-op for non-members. Returns whether anything changed.
    pub async fn leave(store: &dyn Store, group_id: &str, user: &Identity) -> AppResult<bool> {
        let group = load_group(store, group_id).await?;
        if group.owner_id == user.uid {
            return Err(AppError::Validation(
                "the owner cannot leave; delete the group instead".into(),
            ));
        }
        let removed = store.remove_member(group_id, &user.uid).await?;
        let cancelled = store.cancel_pending_request(group_id, &user.uid).await?;
        if removed {
            tracing::info!("User {} left group {}", user.uid, group_id);
        }
        Ok(removed || cancelled)
    }

    pub async fn members(store: &dyn Store, group_id: &str, caller: &Identity) -> AppResult<Vec<Member>> {
        let group = load_group(store, group_id).await?;
        require_reader(store, &group, &caller.uid).await?;
        let members = store.list_members(group_id).await?;
        Ok(members.into_iter().filter(Member::is_active).collect())
    }

    pub async fn requests(
        store: &dyn Store,
        group_id: &str,
        reviewer: &Identity,
        status: Option<RequestStatus>,
    ) -> AppResult<Vec<MembershipRequest>> {
        let group = load_group(store, group_id).await?;
        let role = role_in(store, &group, &reviewer.uid).await?;
        if !role.is_some_and(Role::can_moderate) {
            return Err(AppError::PermissionDenied("only organizers can list requests"));
        }
        store.list_requests(group_id, status).await
    }

    pub async fn remove_member(
        store: &dyn Store,
        actor: &Identity,
        target: &MemberTarget,
    ) -> AppResult<()> {
        let group = load_group(store, &target.group_id).await?;
        let role = require_member(store, &group, &actor.uid).await?;
        if !role.can_manage_members() {
            return Err(AppError::PermissionDenied("only the owner or an admin can remove members"));
        }
        if target.user_id == group.owner_id {
            return Err(AppError::PermissionDenied("the owner cannot be removed"));
        }
        let target_role = role_in(store, &group, &target.user_id)
            .await?
            .ok_or(AppError::NotAMember)?;
        if target_role == Role::Admin && role != Role::Owner {
            return Err(AppError::PermissionDenied("only the owner can remove an admin"));
        }
        store
            .set_member_status(&target.group_id, &target.user_id, MemberStatus::Removed)
            .await?;
        tracing::info!(
            "User {} removed from group {} by {}",
            target.user_id,
            target.group_id,
            actor.uid
        );
        Ok(())
    }

    pub async fn set_role(store: &dyn Store, actor: &Identity, req: &SetRoleRequest) -> AppResult<()> {
        let group = load_group(store, &req.group_id).await?;
        if group.owner_id != actor.uid {
            return Err(AppError::PermissionDenied("only the owner can change roles"));
        }
        if req.role == Role::Owner || req.user_id == group.owner_id {
            return Err(AppError::Validation("ownership cannot be transferred".into()));
        }
        if role_in(store, &group, &req.user_id).await?.is_none() {
            return Err(AppError::NotAMember);
        }
        store
            .set_member_role(&req.group_id, &req.user_id, req.role)
            .await?;
        tracing::info!(
            "User {} is now {} in group {}",
            req.user_id,
            req.role,
            req.group_id
        );
        Ok(())
    }
}

/// Repeating the decision that already stands is a no-op; contradicting it is an error.
fn settle_repeat(request: MembershipRequest, decision: Decision) -> AppResult<MembershipRequest> {
    if request.status == decision.target_status() {
        Ok(request)
    } else {
        Err(AppError::RequestAlreadyResolved(request.status.as_str()))
    }
}
