use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Comment, Post, PostView, ReactionKind, reaction_map};
use crate::notify::{Notification, Notifier, preview};
use crate::routes::group::{load_group, require_member, require_reader, role_in};
use crate::store::Store;
use crate::utils::Identity;

const MAX_POST_LEN: usize = 5000;
const MAX_COMMENT_LEN: usize = 1000;
const MAX_IMAGES: usize = 10;
const NOTIFICATION_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    pub group_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub post_id: String,
    pub kind: ReactionKind,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub post_id: String,
    pub content: String,
}

/// Pinned posts first, newest first within each partition.
pub fn sort_feed(posts: &mut [Post]) {
    posts.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

async fn load_post(store: &dyn Store, post_id: &str) -> AppResult<Post> {
    store
        .get_post(post_id)
        .await?
        .ok_or(AppError::NotFound("post"))
}

async fn view(store: &dyn Store, post: Post) -> AppResult<PostView> {
    let reactions = store.list_reactions(&post.post_id).await?;
    Ok(PostView {
        reactions: reaction_map(&reactions),
        post,
    })
}

impl Post {
    pub async fn create(
        store: &dyn Store,
        notifier: &Notifier,
        author: &Identity,
        req: CreatePostRequest,
    ) -> AppResult<PostView> {
        let group = load_group(store, &req.group_id).await?;
        let role = require_member(store, &group, &author.uid).await?;

        let text = req.text.trim().to_string();
        let image_urls: Vec<String> = req
            .image_urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if text.is_empty() && image_urls.is_empty() {
            return Err(AppError::Validation("a post needs text or an image".into()));
        }
        if text.chars().count() > MAX_POST_LEN {
            return Err(AppError::Validation("post text is too long".into()));
        }
        if image_urls.len() > MAX_IMAGES {
            return Err(AppError::Validation(format!(
                "at most {} images per post",
                MAX_IMAGES
            )));
        }

        let now = Utc::now();
        let post = Post {
            post_id: Uuid::new_v4().to_string(),
            group_id: group.group_id.clone(),
            author_id: author.uid.clone(),
            author_name: author.display_name.clone(),
            author_role: role.as_str().to_string(),
            text,
            image_urls,
            pinned: false,
            comments_count: 0,
            created_at: now,
            updated_at: now,
        };
        store.insert_post(&post).await?;
        tracing::info!("Post {} created in group {}", post.post_id, group.group_id);

        let body = if post.text.is_empty() {
            format!("{} shared a photo", author.display_name)
        } else {
            format!(
                "{}: {}",
                author.display_name,
                preview(&post.text, NOTIFICATION_PREVIEW_CHARS)
            )
        };
        notifier.dispatch(Notification {
            topic: Notifier::group_topic(&group.group_id),
            title: group.name,
            body,
        });

        Ok(PostView {
            post,
            reactions: Default::default(),
        })
    }

    /// Same kind again removes the reaction; another kind replaces it.
    pub async fn toggle_reaction(
        store: &dyn Store,
        post_id: &str,
        user: &Identity,
        kind: ReactionKind,
    ) -> AppResult<PostView> {
        let post = load_post(store, post_id).await?;
        let group = load_group(store, &post.group_id).await?;
        require_member(store, &group, &user.uid).await?;

        let outcome = store
            .toggle_reaction(post_id, &user.uid, kind, Utc::now())
            .await?;
        tracing::debug!(
            "Reaction of {} on {}: {:?} -> {:?}",
            user.uid,
            post_id,
            outcome.previous,
            outcome.current
        );
        view(store, post).await
    }

    pub async fn set_pinned(
        store: &dyn Store,
        post_id: &str,
        actor: &Identity,
        pinned: bool,
    ) -> AppResult<PostView> {
        let post = load_post(store, post_id).await?;
        let group = load_group(store, &post.group_id).await?;
        let role = role_in(store, &group, &actor.uid).await?;
        if !role.is_some_and(|r| r.can_moderate()) {
            return Err(AppError::PermissionDenied("only organizers can pin posts"));
        }
        store.set_post_pinned(post_id, pinned).await?;
        tracing::info!("Post {} pinned={} by {}", post_id, pinned, actor.uid);
        let post = load_post(store, post_id).await?;
        view(store, post).await
    }

    pub async fn delete(store: &dyn Store, post_id: &str, actor: &Identity) -> AppResult<()> {
        let post = load_post(store, post_id).await?;
        if post.author_id != actor.uid {
            let group = load_group(store, &post.group_id).await?;
            let role = role_in(store, &group, &actor.uid).await?;
            if !role.is_some_and(|r| r.can_moderate()) {
                return Err(AppError::PermissionDenied(
                    "only the author or an organizer can delete a post",
                ));
            }
        }
        store.delete_post(post_id).await?;
        tracing::info!("Post {} deleted by {}", post_id, actor.uid);
        Ok(())
    }

    pub async fn feed(store: &dyn Store, group_id: &str, reader: &Identity) -> AppResult<Vec<PostView>> {
        let group = load_group(store, group_id).await?;
        require_reader(store, &group, &reader.uid).await?;
        feed_snapshot(store, group_id).await
    }
}

/// The ordered feed with reactions, without any access check.
async fn feed_snapshot(store: &dyn Store, group_id: &str) -> AppResult<Vec<PostView>> {
    let mut posts = store.list_posts(group_id).await?;
    sort_feed(&mut posts);
    let mut views = Vec::with_capacity(posts.len());
    for post in posts {
        views.push(view(store, post).await?);
    }
    Ok(views)
}

impl Comment {
    pub async fn create(
        store: &dyn Store,
        author: &Identity,
        req: CreateCommentRequest,
    ) -> AppResult<Self> {
        let post = load_post(store, &req.post_id).await?;
        let group = load_group(store, &post.group_id).await?;
        require_member(store, &group, &author.uid).await?;

        let content = req.content.trim().to_string();
        if content.is_empty() {
            return Err(AppError::Validation("comment must not be empty".into()));
        }
        if content.chars().count() > MAX_COMMENT_LEN {
            return Err(AppError::Validation("comment is too long".into()));
        }

        let now = Utc::now();
        let comment = Comment {
            comment_id: Uuid::new_v4().to_string(),
            post_id: post.post_id,
            group_id: post.group_id,
            author_id: author.uid.clone(),
            author_name: author.display_name.clone(),
            content,
            created_at: now,
            updated_at: now,
        };
        store.insert_comment(&comment).await?;
        Ok(comment)
    }

    pub async fn list(store: &dyn Store, post_id: &str, reader: &Identity) -> AppResult<Vec<Self>> {
        let post = load_post(store, post_id).await?;
        let group = load_group(store, &post.group_id).await?;
        require_reader(store, &group, &reader.uid).await?;
        store.list_comments(post_id).await
    }

    pub async fn delete(store: &dyn Store, comment_id: &str, actor: &Identity) -> AppResult<()> {
        let comment = store
            .get_comment(comment_id)
            .await?
            .ok_or(AppError::NotFound("comment"))?;
        if comment.author_id != actor.uid {
            let group = load_group(store, &comment.group_id).await?;
            let role = role_in(store, &group, &actor.uid).await?;
            if !role.is_some_and(|r| r.can_moderate()) {
                return Err(AppError::PermissionDenied(
                    "only the author or an organizer can delete a comment",
                ));
            }
        }
        store.delete_comment(comment_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::models::{Group, GroupKind, GroupSettings, Member, MemberStatus, Role};
    use crate::routes::group::CreateGroupRequest;
    use crate::store::MemoryStore;

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    fn bob() -> Identity {
        Identity::new("bob", "Bob")
    }

    async fn setup() -> (MemoryStore, Group) {
        let store = MemoryStore::new();
        let group = Group::create(
            &store,
            &alice(),
            CreateGroupRequest {
                kind: GroupKind::Group,
                name: "Climbers".into(),
                description: String::new(),
                settings: GroupSettings::default(),
                event: None,
            },
        )
        .await
        .unwrap();
        for (uid, name) in [("bob", "Bob"), ("carol", "Carol")] {
            store
                .add_member(&Member {
                    group_id: group.group_id.clone(),
                    user_id: uid.into(),
                    display_name: name.into(),
                    role: Role::Member,
                    status: MemberStatus::Active,
                    joined_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        (store, group)
    }

    async fn post_in(store: &MemoryStore, group: &Group, author: &Identity, text: &str) -> Post {
        Post::create(
            store,
            &Notifier::disabled(),
            author,
            CreatePostRequest {
                group_id: group.group_id.clone(),
                text: text.into(),
                image_urls: vec![],
            },
        )
        .await
        .unwrap()
        .post
    }

    #[tokio::test]
    async fn strangers_cannot_post() {
        let (store, group) = setup().await;
        let result = Post::create(
            &store,
            &Notifier::disabled(),
            &Identity::new("mallory", "Mallory"),
            CreatePostRequest {
                group_id: group.group_id.clone(),
                text: "hello".into(),
                image_urls: vec![],
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::NotAMember)));
    }

    #[tokio::test]
    async fn new_post_starts_empty_and_records_role() {
        let (store, group) = setup().await;
        let post = post_in(&store, &group, &alice(), "Session saturday").await;
        assert_eq!(post.author_role, "owner");
        assert_eq!(post.comments_count, 0);
        assert!(!post.pinned);
    }

    #[tokio::test]
    async fn empty_post_is_rejected() {
        let (store, group) = setup().await;
        let result = Post::create(
            &store,
            &Notifier::disabled(),
            &bob(),
            CreatePostRequest {
                group_id: group.group_id.clone(),
                text: "   ".into(),
                image_urls: vec![" ".into()],
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn same_reaction_twice_restores_original_state() {
        let (store, group) = setup().await;
        let post = post_in(&store, &group, &alice(), "hi").await;
        let before = Post::toggle_reaction(&store, &post.post_id, &carol(), ReactionKind::Wow)
            .await
            .unwrap()
            .reactions;

        Post::toggle_reaction(&store, &post.post_id, &bob(), ReactionKind::Like)
            .await
            .unwrap();
        let after = Post::toggle_reaction(&store, &post.post_id, &bob(), ReactionKind::Like)
            .await
            .unwrap()
            .reactions;
        assert_eq!(before, after);
    }

    fn carol() -> Identity {
        Identity::new("carol", "Carol")
    }

    #[tokio::test]
    async fn switching_reaction_keeps_user_in_one_kind() {
        let (store, group) = setup().await;
        let post = post_in(&store, &group, &alice(), "hi").await;
        Post::toggle_reaction(&store, &post.post_id, &bob(), ReactionKind::Like)
            .await
            .unwrap();
        let view = Post::toggle_reaction(&store, &post.post_id, &bob(), ReactionKind::Love)
            .await
            .unwrap();

        let kinds: Vec<ReactionKind> = view
            .reactions
            .iter()
            .filter(|(_, users)| users.iter().any(|e| e.user_id == "bob"))
            .map(|(kind, _)| *kind)
            .collect();
        assert_eq!(kinds, vec![ReactionKind::Love]);
    }

    #[tokio::test]
    async fn two_users_like_the_same_post() {
        let (store, group) = setup().await;
        let post = post_in(&store, &group, &alice(), "hi").await;
        Post::toggle_reaction(&store, &post.post_id, &bob(), ReactionKind::Like)
            .await
            .unwrap();
        let view = Post::toggle_reaction(&store, &post.post_id, &carol(), ReactionKind::Like)
            .await
            .unwrap();

        assert_eq!(view.reactions.len(), 1);
        assert_eq!(view.reactions[&ReactionKind::Like].len(), 2);
    }

    #[tokio::test]
    async fn only_moderators_pin() {
        let (store, group) = setup().await;
        let post = post_in(&store, &group, &bob(), "hi").await;

        let denied = Post::set_pinned(&store, &post.post_id, &bob(), true).await;
        assert!(matches!(denied, Err(AppError::PermissionDenied(_))));

        let pinned = Post::set_pinned(&store, &post.post_id, &alice(), true)
            .await
            .unwrap();
        assert!(pinned.post.pinned);
        let unpinned = Post::set_pinned(&store, &post.post_id, &alice(), false)
            .await
            .unwrap();
        assert!(!unpinned.post.pinned);
    }

    #[tokio::test]
    async fn comments_move_the_counter() {
        let (store, group) = setup().await;
        let post = post_in(&store, &group, &alice(), "hi").await;
        let comment = Comment::create(
            &store,
            &bob(),
            CreateCommentRequest {
                post_id: post.post_id.clone(),
                content: "count me in".into(),
            },
        )
        .await
        .unwrap();
        let stored = store.get_post(&post.post_id).await.unwrap().unwrap();
        assert_eq!(stored.comments_count, 1);

        let denied = Comment::delete(&store, &comment.comment_id, &carol()).await;
        assert!(matches!(denied, Err(AppError::PermissionDenied(_))));

        Comment::delete(&store, &comment.comment_id, &bob()).await.unwrap();
        let stored = store.get_post(&post.post_id).await.unwrap().unwrap();
        assert_eq!(stored.comments_count, 0);
    }

    #[test]
    fn pinned_posts_lead_then_newest_first() {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let post = |id: &str, pinned: bool, minutes: i64| Post {
            post_id: id.into(),
            group_id: "g".into(),
            author_id: "a".into(),
            author_name: "A".into(),
            author_role: "member".into(),
            text: id.into(),
            image_urls: vec![],
            pinned,
            comments_count: 0,
            created_at: base + Duration::minutes(minutes),
            updated_at: base,
        };
        let mut posts = vec![
            post("old", false, 0),
            post("old-pin", true, 1),
            post("new", false, 10),
            post("new-pin", true, 5),
        ];
        sort_feed(&mut posts);
        let order: Vec<&str> = posts.iter().map(|p| p.post_id.as_str()).collect();
        assert_eq!(order, vec!["new-pin", "old-pin", "new", "old"]);
    }
}
