//! Event suggestions.
//!
//! Scoring is a fixed-weight sum; ties keep the order candidates came in.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::AppResult;
use crate::models::{Group, GroupKind, SkillLevel, UserProfile};
use crate::store::{GroupQuery, Store};
use crate::utils::Identity;

pub const MAX_SUGGESTIONS: usize = 3;

const FAVORITE_SPORT: u32 = 30;
const SKILL_MATCH: u32 = 20;
const LOCATION_MATCH: u32 = 15;
const RECENTLY_CREATED: u32 = 10;
const PLACES_LEFT: u32 = 5;
const STARTS_SOON: u32 = 10;

const RECENT_WINDOW_DAYS: i64 = 7;
const SOON_WINDOW_DAYS: i64 = 7;
const MIN_PLACES_LEFT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    #[serde(flatten)]
    pub event: Group,
    pub score: u32,
    pub reasons: Vec<&'static str>,
}

fn score(profile: &UserProfile, event: &Group, now: DateTime<Utc>) -> (u32, Vec<&'static str>) {
    let mut total = 0;
    let mut reasons = Vec::new();
    let mut add = |points: u32, reason: &'static str| {
        total += points;
        reasons.push(reason);
    };

    if let Some(details) = &event.event {
        let sport = details.sport.trim().to_lowercase();
        if profile
            .favorite_sports
            .iter()
            .any(|s| s.trim().to_lowercase() == sport)
        {
            add(FAVORITE_SPORT, "favorite_sport");
        }

        let declared = profile
            .skill_levels
            .iter()
            .find(|(s, _)| s.trim().to_lowercase() == sport)
            .map(|(_, level)| *level);
        let skill_fits = match (declared, details.skill_level) {
            (Some(_), Some(SkillLevel::All)) => true,
            (Some(mine), Some(wanted)) => mine == wanted,
            _ => false,
        };
        if skill_fits {
            add(SKILL_MATCH, "skill_level");
        }

        if let Some(home) = profile.location.as_deref().map(str::trim) {
            let place = details.location.to_lowercase();
            if !home.is_empty() && place.contains(&home.to_lowercase()) {
                add(LOCATION_MATCH, "location");
            }
        }

        if details.starts_at <= now + Duration::days(SOON_WINDOW_DAYS) {
            add(STARTS_SOON, "starts_soon");
        }
    }

    if now - event.created_at <= Duration::days(RECENT_WINDOW_DAYS) {
        add(RECENTLY_CREATED, "new");
    }
    if event
        .remaining_places()
        .is_some_and(|left| left >= MIN_PLACES_LEFT)
    {
        add(PLACES_LEFT, "places_left");
    }

    (total, reasons)
}

fn is_candidate(uid: &str, joined: &HashSet<String>, event: &Group, now: DateTime<Utc>) -> bool {
    let Some(details) = &event.event else {
        return false;
    };
    event.kind == GroupKind::Event
        && event.owner_id != uid
        && !joined.contains(&event.group_id)
        && !event.is_full()
        && details.starts_at >= now
}

/// Ranks upcoming events for a user. Events the user created, already
/// joined, that are full or already started are left out.
pub fn suggest_events(
    profile: &UserProfile,
    uid: &str,
    candidates: Vec<Group>,
    joined: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<Suggestion> {
    let mut ranked: Vec<Suggestion> = candidates
        .into_iter()
        .filter(|e| is_candidate(uid, joined, e, now))
        .map(|event| {
            let (score, reasons) = score(profile, &event, now);
            Suggestion {
                event,
                score,
                reasons,
            }
        })
        .collect();
    // sort_by is stable
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked.truncate(MAX_SUGGESTIONS);
    ranked
}

pub async fn suggestions_for(store: &dyn Store, user: &Identity) -> AppResult<Vec<Suggestion>> {
    let profile = UserProfile::load(store, user).await?;
    let candidates = store
        .list_groups(&GroupQuery {
            kind: Some(GroupKind::Event),
            ..Default::default()
        })
        .await?;
    let joined: HashSet<String> = store
        .list_groups(&GroupQuery {
            kind: Some(GroupKind::Event),
            member_id: Some(user.uid.clone()),
            limit: None,
        })
        .await?
        .into_iter()
        .map(|g| g.group_id)
        .collect();

    let suggestions = suggest_events(&profile, &user.uid, candidates, &joined, Utc::now());
    tracing::debug!("{} suggestions for {}", suggestions.len(), user.uid);
    Ok(suggestions)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;
    use crate::models::{EventDetails, GroupSettings, GroupStats};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap()
    }

    fn event(id: &str, sport: &str, location: &str, starts_in_days: i64) -> Group {
        Group {
            group_id: id.into(),
            kind: GroupKind::Event,
            owner_id: "organizer".into(),
            name: id.into(),
            description: String::new(),
            settings: GroupSettings::default(),
            event: Some(EventDetails {
                sport: sport.into(),
                skill_level: None,
                location: location.into(),
                starts_at: now() + Duration::days(starts_in_days),
            }),
            stats: GroupStats { member_count: 1 },
            // old enough to miss the recency bonus
            created_at: now() - Duration::days(30),
            updated_at: now() - Duration::days(30),
        }
    }

    fn profile() -> UserProfile {
        UserProfile {
            uid: "me".into(),
            display_name: "Me".into(),
            age: Some(28),
            favorite_sports: vec!["tennis".into()],
            skill_levels: BTreeMap::from([("tennis".to_string(), SkillLevel::Intermediate)]),
            location: Some("lyon".into()),
            updated_at: now(),
        }
    }

    #[test]
    fn full_match_scores_every_weight() {
        let mut e = event("e1", "Tennis", "Parc de la Tête d'Or, Lyon", 2);
        e.event.as_mut().unwrap().skill_level = Some(SkillLevel::Intermediate);
        e.created_at = now() - Duration::days(1);
        e.settings.max_members = Some(10);

        let out = suggest_events(&profile(), "me", vec![e], &HashSet::new(), now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 30 + 20 + 15 + 10 + 5 + 10);
    }

    #[test]
    fn open_level_events_match_any_declared_level() {
        let mut e = event("e1", "tennis", "Paris", 30);
        e.event.as_mut().unwrap().skill_level = Some(SkillLevel::All);
        let out = suggest_events(&profile(), "me", vec![e], &HashSet::new(), now());
        assert_eq!(out[0].score, FAVORITE_SPORT + SKILL_MATCH);
    }

    #[test]
    fn excluded_events_never_show_up() {
        let mut own = event("own", "tennis", "Lyon", 1);
        own.owner_id = "me".into();
        let joined = event("joined", "tennis", "Lyon", 1);
        let past = event("past", "tennis", "Lyon", -1);
        let mut full = event("full", "tennis", "Lyon", 1);
        full.settings.max_members = Some(1);
        let mut plain_group = event("group", "tennis", "Lyon", 1);
        plain_group.kind = GroupKind::Group;
        let ok = event("ok", "golf", "Nice", 40);

        let out = suggest_events(
            &profile(),
            "me",
            vec![own, joined, past, full, plain_group, ok],
            &HashSet::from(["joined".to_string()]),
            now(),
        );
        let ids: Vec<&str> = out.iter().map(|s| s.event.group_id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
        assert_eq!(out[0].score, 0);
    }

    #[test]
    fn top_three_with_ties_in_input_order() {
        let candidates = vec![
            event("a", "golf", "Nice", 30),
            event("b", "tennis", "Nice", 30),
            event("c", "golf", "Nice", 30),
            event("d", "golf", "Nice", 30),
            event("e", "tennis", "Lyon", 30),
        ];
        let out = suggest_events(&profile(), "me", candidates, &HashSet::new(), now());
        let ids: Vec<&str> = out.iter().map(|s| s.event.group_id.as_str()).collect();
        assert_eq!(ids, vec!["e", "b", "a"]);
    }
}
