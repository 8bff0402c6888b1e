//! Server-sent snapshot streams.
//!
//! A stream sends the full current set once, then again after every change
//! that touches the subscribed group. Clients never apply diffs.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, future::BoxFuture, stream};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{AppError, AppResult, ErrorKind};
use crate::store::{ChangeEvent, Collection, Store};

pub type Loader<T> = Arc<dyn Fn() -> BoxFuture<'static, AppResult<T>> + Send + Sync>;

pub fn snapshot_sse<T>(
    store: &Arc<dyn Store>,
    group_id: String,
    collections: &'static [Collection],
    load: Loader<T>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<T>>
where
    T: Serialize + Send + 'static,
{
    Sse::new(snapshot_stream(store, group_id, collections, load)).keep_alive(KeepAlive::default())
}

/// Losing access to the group ends the stream after one `error` event.
fn revokes_access(e: &AppError) -> bool {
    matches!(e, AppError::NotAMember)
        || matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::NotFound)
}

struct Cursor {
    rx: broadcast::Receiver<ChangeEvent>,
    first: bool,
    done: bool,
}

pub fn snapshot_stream<T>(
    store: &Arc<dyn Store>,
    group_id: String,
    collections: &'static [Collection],
    load: Loader<T>,
) -> impl Stream<Item = Result<Event, Infallible>> + use<T>
where
    T: Serialize + Send + 'static,
{
    // subscribe before the first load so no change slips in between
    let cursor = Cursor {
        rx: store.subscribe(),
        first: true,
        done: false,
    };
    let group_id: Arc<str> = Arc::from(group_id);

    stream::unfold(cursor, move |mut cursor| {
        let load = load.clone();
        let group_id = group_id.clone();
        async move {
            if cursor.done {
                return None;
            }
            if !cursor.first {
                loop {
                    match cursor.rx.recv().await {
                        Ok(change)
                            if *change.group_id == *group_id
                                && collections.contains(&change.collection) =>
                        {
                            break;
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(
                                "Subscriber for {} lagged by {} changes, resending",
                                group_id,
                                skipped
                            );
                            break;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
            cursor.first = false;

            let snapshot = load().await;
            if let Err(e) = &snapshot {
                if revokes_access(e) {
                    tracing::info!("Closing stream for {}: {}", group_id, e);
                    cursor.done = true;
                }
            }
            Some((Ok(render(snapshot)), cursor))
        }
    })
}

fn render<T: Serialize>(snapshot: AppResult<T>) -> Event {
    let event = match snapshot {
        Ok(data) => Event::default().event("snapshot").json_data(&data),
        Err(e) => Ok(Event::default().event("error").data(e.to_string())),
    };
    event.unwrap_or_else(|e| {
        tracing::error!("Failed to encode snapshot: {}", e);
        Event::default().event("error").data("encoding failed")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Group, GroupKind, GroupSettings, GroupStats, Member, MemberStatus, Role};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use futures_util::{FutureExt, StreamExt};

    fn sample_group(id: &str) -> (Group, Member) {
        let now = Utc::now();
        let group = Group {
            group_id: id.into(),
            kind: GroupKind::Group,
            owner_id: "alice".into(),
            name: "Runners".into(),
            description: String::new(),
            settings: GroupSettings::default(),
            event: None,
            stats: GroupStats::default(),
            created_at: now,
            updated_at: now,
        };
        let owner = Member {
            group_id: id.into(),
            user_id: "alice".into(),
            display_name: "Alice".into(),
            role: Role::Owner,
            status: MemberStatus::Active,
            joined_at: now,
        };
        (group, owner)
    }

    #[tokio::test]
    async fn emits_initial_snapshot_then_one_per_relevant_change() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (group, owner) = sample_group("g1");
        store.insert_group(&group, &owner).await.unwrap();
        let (other, other_owner) = sample_group("g2");
        store.insert_group(&other, &other_owner).await.unwrap();

        let reader = store.clone();
        let load: Loader<usize> = Arc::new(move || {
            let store = reader.clone();
            async move { Ok::<_, crate::error::AppError>(store.list_members("g1").await?.len()) }
                .boxed()
        });
        let mut stream = Box::pin(snapshot_stream(
            &store,
            "g1".into(),
            &[Collection::Members],
            load,
        ));

        assert!(stream.next().await.is_some());

        // a change in another group is ignored, the one in g1 is not
        let bob = Member {
            user_id: "bob".into(),
            display_name: "Bob".into(),
            role: Role::Member,
            ..owner.clone()
        };
        store
            .add_member(&Member {
                group_id: "g2".into(),
                ..bob.clone()
            })
            .await
            .unwrap();
        store.add_member(&bob).await.unwrap();

        let next = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn removed_participant_gets_one_error_and_the_stream_ends() {
        use crate::models::{ChatMessage, EventDetails};
        use crate::notify::Notifier;
        use crate::routes::chat::PostMessageRequest;
        use crate::routes::group::{CreateGroupRequest, MemberTarget};
        use crate::utils::Identity;

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let organizer = Identity::new("org", "Organizer");
        let player = Identity::new("p1", "P1");
        let event = Group::create(
            store.as_ref(),
            &organizer,
            CreateGroupRequest {
                kind: GroupKind::Event,
                name: "Five-a-side".into(),
                description: String::new(),
                settings: GroupSettings::default(),
                event: Some(EventDetails {
                    sport: "football".into(),
                    skill_level: None,
                    location: "Lyon".into(),
                    starts_at: Utc::now() + chrono::Duration::days(2),
                }),
            },
        )
        .await
        .unwrap();
        Group::request_to_join(
            store.as_ref(),
            &Notifier::disabled(),
            &event.group_id,
            &player,
            vec![],
        )
        .await
        .unwrap();

        let reader = store.clone();
        let event_id = event.group_id.clone();
        let who = player.clone();
        let load: Loader<Vec<ChatMessage>> = Arc::new(move || {
            let store = reader.clone();
            let event_id = event_id.clone();
            let who = who.clone();
            async move { ChatMessage::list(store.as_ref(), &event_id, &who).await }.boxed()
        });
        let mut stream = Box::pin(snapshot_stream(
            &store,
            event.group_id.clone(),
            &[Collection::Members, Collection::Messages],
            load,
        ));
        let first = stream.next().await.unwrap().unwrap();
        assert!(format!("{:?}", first).contains("event: snapshot"));

        Group::remove_member(
            store.as_ref(),
            &organizer,
            &MemberTarget {
                group_id: event.group_id.clone(),
                user_id: "p1".into(),
            },
        )
        .await
        .unwrap();
        ChatMessage::post(
            store.as_ref(),
            &organizer,
            PostMessageRequest {
                event_id: event.group_id.clone(),
                content: "secret plan".into(),
            },
        )
        .await
        .unwrap();

        let wait = std::time::Duration::from_secs(1);
        let revoked = tokio::time::timeout(wait, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let revoked = format!("{:?}", revoked);
        assert!(revoked.contains("event: error"));
        assert!(!revoked.contains("secret plan"));

        let after = tokio::time::timeout(wait, stream.next()).await.unwrap();
        assert!(after.is_none());
    }
}
