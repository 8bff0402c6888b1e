use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SkillLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    pub display_name: String,
    pub age: Option<u32>,
    #[serde(default)]
    pub favorite_sports: Vec<String>,
    /// Self-declared level per sport.
    #[serde(default)]
    pub skill_levels: BTreeMap<String, SkillLevel>,
    pub location: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn empty(uid: &str, display_name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            display_name: display_name.to_string(),
            age: None,
            favorite_sports: Vec::new(),
            skill_levels: BTreeMap::new(),
            location: None,
            updated_at: Utc::now(),
        }
    }
}
