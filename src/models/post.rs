use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Love,
    Haha,
    Wow,
    Sad,
    Angry,
}

impl ReactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReactionKind::Like => "like",
            ReactionKind::Love => "love",
            ReactionKind::Haha => "haha",
            ReactionKind::Wow => "wow",
            ReactionKind::Sad => "sad",
            ReactionKind::Angry => "angry",
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReactionKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "like" => Ok(ReactionKind::Like),
            "love" => Ok(ReactionKind::Love),
            "haha" => Ok(ReactionKind::Haha),
            "wow" => Ok(ReactionKind::Wow),
            "sad" => Ok(ReactionKind::Sad),
            "angry" => Ok(ReactionKind::Angry),
            other => Err(AppError::WriteFailed(format!("unknown reaction kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: String,
    pub group_id: String,
    pub author_id: String,
    pub author_name: String,
    /// Role label of the author when the post was written.
    pub author_role: String,
    pub text: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub pinned: bool,
    pub comments_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One user's reaction; stored keyed by `(post_id, user_id)` so a user holds at most one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub post_id: String,
    pub user_id: String,
    pub kind: ReactionKind,
    pub reacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEntry {
    pub user_id: String,
    pub reacted_at: DateTime<Utc>,
}

pub type ReactionMap = BTreeMap<ReactionKind, Vec<ReactionEntry>>;

/// Groups reaction rows into the `kind -> [user]` map clients render. Kinds
/// without reactions are absent.
pub fn reaction_map(reactions: &[Reaction]) -> ReactionMap {
    let mut map = ReactionMap::new();
    for r in reactions {
        map.entry(r.kind).or_default().push(ReactionEntry {
            user_id: r.user_id.clone(),
            reacted_at: r.reacted_at,
        });
    }
    for entries in map.values_mut() {
        entries.sort_by(|a, b| a.reacted_at.cmp(&b.reacted_at));
    }
    map
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostView {
    #[serde(flatten)]
    pub post: Post,
    pub reactions: ReactionMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: String,
    pub post_id: String,
    pub group_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
