use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    ChatMessage, Group, GroupKind, MessageStatus, ModerationAction, Report, ReportOutcome,
    ReportReason,
};
use crate::routes::group::{load_group, require_member};
use crate::store::Store;
use crate::utils::Identity;

const MAX_MESSAGE_LEN: usize = 1000;
const MAX_REPORT_DESCRIPTION_LEN: usize = 500;

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub event_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportMessageRequest {
    pub message_id: String,
    pub reason: ReportReason,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModerateRequest {
    pub message_id: String,
    pub action: ModerationAction,
}

/// Organizers see everything, including reports. Everyone else sees visible
/// messages only, without the report list.
pub fn visible_to(messages: Vec<ChatMessage>, organizer: bool) -> Vec<ChatMessage> {
    if organizer {
        return messages;
    }
    messages
        .into_iter()
        .filter(|m| m.status == MessageStatus::Visible)
        .map(|mut m| {
            m.reports.clear();
            m
        })
        .collect()
}

async fn load_event(store: &dyn Store, event_id: &str) -> AppResult<Group> {
    let group = load_group(store, event_id).await?;
    if group.kind != GroupKind::Event {
        return Err(AppError::NotFound("event"));
    }
    Ok(group)
}

async fn load_message(store: &dyn Store, message_id: &str) -> AppResult<ChatMessage> {
    store
        .get_message(message_id)
        .await?
        .ok_or(AppError::NotFound("message"))
}

impl ChatMessage {
    /// Only the event creator and its active participants may write.
    pub async fn post(
        store: &dyn Store,
        author: &Identity,
        req: PostMessageRequest,
    ) -> AppResult<Self> {
        let event = load_event(store, &req.event_id).await?;
        require_member(store, &event, &author.uid).await?;

        let content = req.content.trim().to_string();
        if content.is_empty() {
            return Err(AppError::Validation("message must not be empty".into()));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::Validation("message is too long".into()));
        }

        let message = ChatMessage {
            message_id: Uuid::new_v4().to_string(),
            event_id: event.group_id.clone(),
            author_id: author.uid.clone(),
            author_name: author.display_name.clone(),
            content,
            status: MessageStatus::Visible,
            is_organizer: event.owner_id == author.uid,
            reports: Vec::new(),
            created_at: Utc::now(),
        };
        store.insert_message(&message).await?;
        Ok(message)
    }

    pub async fn report(
        store: &dyn Store,
        reporter: &Identity,
        req: ReportMessageRequest,
    ) -> AppResult<Self> {
        let message = load_message(store, &req.message_id).await?;
        let event = load_event(store, &message.event_id).await?;
        require_member(store, &event, &reporter.uid).await?;

        let description = req
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if description
            .as_ref()
            .is_some_and(|d| d.chars().count() > MAX_REPORT_DESCRIPTION_LEN)
        {
            return Err(AppError::Validation("report description is too long".into()));
        }

        let report = Report {
            reporter_id: reporter.uid.clone(),
            reason: req.reason,
            description,
            reported_at: Utc::now(),
        };
        match store.add_report(&req.message_id, &report).await? {
            ReportOutcome::Duplicate => Err(AppError::DuplicateReport),
            ReportOutcome::Added(updated) => {
                tracing::info!(
                    "Message {} reported by {} for {} ({} reports)",
                    req.message_id,
                    reporter.uid,
                    report.reason.as_str(),
                    updated.reports.len()
                );
                Ok(updated)
            }
        }
    }

    pub async fn moderate(
        store: &dyn Store,
        organizer: &Identity,
        req: ModerateRequest,
    ) -> AppResult<Self> {
        let message = load_message(store, &req.message_id).await?;
        let event = load_event(store, &message.event_id).await?;
        if event.owner_id != organizer.uid {
            return Err(AppError::PermissionDenied("only the organizer can moderate the chat"));
        }
        let status = req.action.target_status();
        store.set_message_status(&req.message_id, status).await?;
        tracing::info!(
            "Message {} set to {} by {}",
            req.message_id,
            status.as_str(),
            organizer.uid
        );
        load_message(store, &req.message_id).await
    }

    pub async fn delete(store: &dyn Store, message_id: &str, actor: &Identity) -> AppResult<()> {
        let message = load_message(store, message_id).await?;
        if message.author_id != actor.uid {
            let event = load_event(store, &message.event_id).await?;
            if event.owner_id != actor.uid {
                return Err(AppError::PermissionDenied(
                    "only the author or the organizer can delete a message",
                ));
            }
        }
        store.delete_message(message_id).await?;
        tracing::info!("Message {} deleted by {}", message_id, actor.uid);
        Ok(())
    }

    pub async fn list(store: &dyn Store, event_id: &str, reader: &Identity) -> AppResult<Vec<Self>> {
        let event = load_event(store, event_id).await?;
        require_member(store, &event, &reader.uid).await?;
        chat_snapshot(store, &event, &reader.uid).await
    }
}

async fn chat_snapshot(
    store: &dyn Store,
    event: &Group,
    reader_id: &str,
) -> AppResult<Vec<ChatMessage>> {
    let messages = store.list_messages(&event.group_id).await?;
    Ok(visible_to(messages, event.owner_id == reader_id))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::models::{EventDetails, GroupSettings, Member, MemberStatus, Role, SkillLevel};
    use crate::routes::group::CreateGroupRequest;
    use crate::store::MemoryStore;

    fn organizer() -> Identity {
        Identity::new("org", "Organizer")
    }

    fn player(uid: &str) -> Identity {
        Identity::new(uid, uid.to_uppercase())
    }

    async fn setup() -> (MemoryStore, Group) {
        let store = MemoryStore::new();
        let event = Group::create(
            &store,
            &organizer(),
            CreateGroupRequest {
                kind: GroupKind::Event,
                name: "Five-a-side".into(),
                description: String::new(),
                settings: GroupSettings::default(),
                event: Some(EventDetails {
                    sport: "football".into(),
                    skill_level: Some(SkillLevel::All),
                    location: "Lyon".into(),
                    starts_at: Utc::now() + Duration::days(2),
                }),
            },
        )
        .await
        .unwrap();
        for uid in ["p1", "p2", "p3"] {
            store
                .add_member(&Member {
                    group_id: event.group_id.clone(),
                    user_id: uid.into(),
                    display_name: uid.into(),
                    role: Role::Member,
                    status: MemberStatus::Active,
                    joined_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        (store, event)
    }

    async fn say(store: &MemoryStore, event: &Group, who: &Identity, text: &str) -> ChatMessage {
        ChatMessage::post(
            store,
            who,
            PostMessageRequest {
                event_id: event.group_id.clone(),
                content: text.into(),
            },
        )
        .await
        .unwrap()
    }

    fn report_of(message: &ChatMessage) -> ReportMessageRequest {
        ReportMessageRequest {
            message_id: message.message_id.clone(),
            reason: ReportReason::Spam,
            description: None,
        }
    }

    #[tokio::test]
    async fn organizer_flag_is_resolved_at_write_time() {
        let (store, event) = setup().await;
        assert!(say(&store, &event, &organizer(), "welcome").await.is_organizer);
        assert!(!say(&store, &event, &player("p1"), "hi").await.is_organizer);

        let outsider = ChatMessage::post(
            &store,
            &player("zed"),
            PostMessageRequest {
                event_id: event.group_id.clone(),
                content: "let me in".into(),
            },
        )
        .await;
        assert!(matches!(outsider, Err(AppError::NotAMember)));
    }

    #[tokio::test]
    async fn second_report_by_same_user_is_rejected() {
        let (store, event) = setup().await;
        let message = say(&store, &event, &player("p1"), "buy stuff").await;

        ChatMessage::report(&store, &player("p2"), report_of(&message))
            .await
            .unwrap();
        let again = ChatMessage::report(&store, &player("p2"), report_of(&message)).await;
        assert!(matches!(again, Err(AppError::DuplicateReport)));

        let stored = store.get_message(&message.message_id).await.unwrap().unwrap();
        let by_p2 = stored.reports.iter().filter(|r| r.reporter_id == "p2").count();
        assert_eq!(by_p2, 1);
        assert_eq!(stored.status, MessageStatus::Visible);
    }

    #[tokio::test]
    async fn three_reports_hide_message_from_participants() {
        let (store, event) = setup().await;
        let message = say(&store, &event, &player("p1"), "buy stuff").await;

        for uid in ["p2", "p3", "org"] {
            ChatMessage::report(&store, &player(uid), report_of(&message))
                .await
                .unwrap();
        }
        let stored = store.get_message(&message.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Reported);

        let seen_by_player = ChatMessage::list(&store, &event.group_id, &player("p2"))
            .await
            .unwrap();
        assert!(seen_by_player.is_empty());
        let seen_by_organizer = ChatMessage::list(&store, &event.group_id, &organizer())
            .await
            .unwrap();
        assert_eq!(seen_by_organizer.len(), 1);
        assert_eq!(seen_by_organizer[0].reports.len(), 3);
    }

    #[tokio::test]
    async fn only_organizer_moderates() {
        let (store, event) = setup().await;
        let message = say(&store, &event, &player("p1"), "rude").await;

        let denied = ChatMessage::moderate(
            &store,
            &player("p2"),
            ModerateRequest {
                message_id: message.message_id.clone(),
                action: ModerationAction::Hide,
            },
        )
        .await;
        assert!(matches!(denied, Err(AppError::PermissionDenied(_))));

        let hidden = ChatMessage::moderate(
            &store,
            &organizer(),
            ModerateRequest {
                message_id: message.message_id.clone(),
                action: ModerationAction::Hide,
            },
        )
        .await
        .unwrap();
        assert_eq!(hidden.status, MessageStatus::Hidden);

        let shown = ChatMessage::moderate(
            &store,
            &organizer(),
            ModerateRequest {
                message_id: message.message_id.clone(),
                action: ModerationAction::Show,
            },
        )
        .await
        .unwrap();
        assert_eq!(shown.status, MessageStatus::Visible);
    }

    #[tokio::test]
    async fn author_or_organizer_may_delete() {
        let (store, event) = setup().await;
        let first = say(&store, &event, &player("p1"), "one").await;
        let second = say(&store, &event, &player("p1"), "two").await;

        let denied = ChatMessage::delete(&store, &first.message_id, &player("p2")).await;
        assert!(matches!(denied, Err(AppError::PermissionDenied(_))));

        ChatMessage::delete(&store, &first.message_id, &player("p1"))
            .await
            .unwrap();
        ChatMessage::delete(&store, &second.message_id, &organizer())
            .await
            .unwrap();
        assert!(store.list_messages(&event.group_id).await.unwrap().is_empty());
    }

    #[test]
    fn participants_never_see_report_details() {
        let message = ChatMessage {
            message_id: "m".into(),
            event_id: "e".into(),
            author_id: "p1".into(),
            author_name: "P1".into(),
            content: "hey".into(),
            status: MessageStatus::Visible,
            is_organizer: false,
            reports: vec![Report {
                reporter_id: "p2".into(),
                reason: ReportReason::Other,
                description: Some("meh".into()),
                reported_at: Utc::now(),
            }],
            created_at: Utc::now(),
        };
        let hidden = ChatMessage {
            message_id: "h".into(),
            status: MessageStatus::Hidden,
            ..message.clone()
        };

        let seen = visible_to(vec![message.clone(), hidden.clone()], false);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].reports.is_empty());
        assert_eq!(visible_to(vec![message, hidden], true).len(), 2);
    }
}
