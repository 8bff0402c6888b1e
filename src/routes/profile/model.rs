use std::collections::BTreeMap;

use chrono::Utc;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::models::{SkillLevel, UserProfile};
use crate::store::Store;
use crate::utils::Identity;

const MAX_AGE: u32 = 120;
const MAX_SPORTS: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub age: Option<u32>,
    pub favorite_sports: Option<Vec<String>>,
    pub skill_levels: Option<BTreeMap<String, SkillLevel>>,
    pub location: Option<String>,
}

fn normalize_sport(sport: &str) -> String {
    sport.trim().to_lowercase()
}

impl UserProfile {
    /// The caller's profile, or an empty one when none was saved yet.
    pub async fn load(store: &dyn Store, user: &Identity) -> AppResult<Self> {
        Ok(store
            .get_profile(&user.uid)
            .await?
            .unwrap_or_else(|| UserProfile::empty(&user.uid, &user.display_name)))
    }

    pub async fn update(
        store: &dyn Store,
        user: &Identity,
        req: UpdateProfileRequest,
    ) -> AppResult<Self> {
        let mut profile = Self::load(store, user).await?;

        if let Some(name) = req.display_name {
            let name = name.trim();
            if name.is_empty() {
                return Err(AppError::Validation("display name must not be empty".into()));
            }
            profile.display_name = name.to_string();
        }
        if let Some(age) = req.age {
            if age > MAX_AGE {
                return Err(AppError::Validation(format!("age must be at most {}", MAX_AGE)));
            }
            profile.age = Some(age);
        }
        if let Some(sports) = req.favorite_sports {
            let mut sports: Vec<String> = sports
                .iter()
                .map(|s| normalize_sport(s))
                .filter(|s| !s.is_empty())
                .collect();
            sports.sort();
            sports.dedup();
            if sports.len() > MAX_SPORTS {
                return Err(AppError::Validation(format!(
                    "at most {} favorite sports",
                    MAX_SPORTS
                )));
            }
            profile.favorite_sports = sports;
        }
        if let Some(levels) = req.skill_levels {
            profile.skill_levels = levels
                .into_iter()
                .map(|(sport, level)| (normalize_sport(&sport), level))
                .filter(|(sport, _)| !sport.is_empty())
                .collect();
        }
        if let Some(location) = req.location {
            let location = location.trim();
            profile.location = (!location.is_empty()).then(|| location.to_string());
        }
        profile.updated_at = Utc::now();

        store.put_profile(&profile).await?;
        tracing::info!("Profile of {} updated", user.uid);
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn missing_profile_reads_as_empty() {
        let store = MemoryStore::new();
        let profile = UserProfile::load(&store, &Identity::new("u1", "Una")).await.unwrap();
        assert_eq!(profile.display_name, "Una");
        assert!(profile.age.is_none());
        assert!(profile.favorite_sports.is_empty());
    }

    #[tokio::test]
    async fn update_normalizes_sports_and_keeps_untouched_fields() {
        let store = MemoryStore::new();
        let user = Identity::new("u1", "Una");
        UserProfile::update(
            &store,
            &user,
            UpdateProfileRequest {
                age: Some(31),
                location: Some(" Lyon ".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let profile = UserProfile::update(
            &store,
            &user,
            UpdateProfileRequest {
                favorite_sports: Some(vec!["Tennis".into(), " tennis".into(), "Padel".into()]),
                skill_levels: Some(BTreeMap::from([("Tennis".to_string(), SkillLevel::Advanced)])),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(profile.age, Some(31));
        assert_eq!(profile.location.as_deref(), Some("Lyon"));
        assert_eq!(profile.favorite_sports, vec!["padel", "tennis"]);
        assert_eq!(profile.skill_levels.get("tennis"), Some(&SkillLevel::Advanced));
        assert_eq!(store.get_profile("u1").await.unwrap(), Some(profile));
    }

    #[tokio::test]
    async fn implausible_age_is_rejected() {
        let store = MemoryStore::new();
        let result = UserProfile::update(
            &store,
            &Identity::new("u1", "Una"),
            UpdateProfileRequest {
                age: Some(400),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
