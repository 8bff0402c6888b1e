use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use smaaks_backend::{
    AppState,
    config::Config,
    router::build_router,
    store::{MemoryStore, Store},
    utils::{Identity, error_codes, generate_token},
};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    config: Config,
}

impl TestApp {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let config = Config::local();
        let state = AppState::new(store.clone(), config.clone());
        Self {
            router: build_router(state),
            store,
            config,
        }
    }

    fn token(&self, identity: &Identity) -> String {
        generate_token(identity, &self.config).unwrap().0
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        who: Option<&Identity>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.config.api_base_uri, path));
        if let Some(identity) = who {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token(identity)),
            );
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn post(&self, path: &str, who: &Identity, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, path, Some(who), Some(body)).await
    }

    async fn get(&self, path: &str, who: &Identity) -> (StatusCode, Value) {
        self.call(Method::GET, path, Some(who), None).await
    }
}

fn alice() -> Identity {
    Identity::new("alice", "Alice")
}

fn bob() -> Identity {
    Identity::new("bob", "Bob")
}

async fn create_hiking_group(app: &TestApp, requires_approval: bool) -> String {
    let (status, body) = app
        .post(
            "/groups/create",
            &alice(),
            json!({
                "name": "Hikers",
                "description": "Weekend hikes",
                "settings": {
                    "requires_approval": requires_approval,
                    "questions": [{"id": "q1", "text": "Why do you want to join?", "required": true}]
                }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["code"], error_codes::SUCCESS);
    body["resp_data"]["group_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_needs_no_token() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resp_data"], "ok");
}

#[tokio::test]
async fn protected_routes_reject_missing_token() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::GET, "/groups/mine", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], error_codes::AUTH_FAILED);
}

#[tokio::test]
async fn request_then_approve_scenario() {
    let app = TestApp::new();
    let group_id = create_hiking_group(&app, true).await;

    let (status, body) = app
        .post(
            "/groups/join",
            &bob(),
            json!({
                "group_id": group_id,
                "answers": [{"question_id": "q1", "answer": "Because I love hiking"}]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resp_data"]["outcome"], "pending");
    assert_eq!(body["resp_data"]["record"]["status"], "pending");
    assert_eq!(
        body["resp_data"]["record"]["answers"][0]["answer"],
        "Because I love hiking"
    );
    let request_id = body["resp_data"]["record"]["request_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(app.store.get_member(&group_id, "bob").await.unwrap().is_none());

    // bob cannot approve himself
    let (status, _) = app
        .post(
            "/groups/requests/respond",
            &bob(),
            json!({"request_id": request_id, "decision": "approve"}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post(
            "/groups/requests/respond",
            &alice(),
            json!({"request_id": request_id, "decision": "approve"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resp_data"]["status"], "approved");

    let (_, body) = app
        .get(&format!("/groups/by-id?group_id={}", group_id), &bob())
        .await;
    assert_eq!(body["resp_data"]["stats"]["member_count"], 2);
    assert_eq!(body["resp_data"]["my_role"], "member");

    let (_, body) = app
        .get(&format!("/groups/members?group_id={}", group_id), &alice())
        .await;
    let members = body["resp_data"].as_array().unwrap();
    assert!(members.iter().any(|m| m["user_id"] == "bob"
        && m["role"] == "member"
        && m["status"] == "active"));
}

#[tokio::test]
async fn duplicate_join_maps_to_conflict() {
    let app = TestApp::new();
    let group_id = create_hiking_group(&app, false).await;

    let (status, body) = app
        .post("/groups/join", &bob(), json!({"group_id": group_id}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resp_data"]["outcome"], "joined");

    let (status, body) = app
        .post("/groups/join", &bob(), json!({"group_id": group_id}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], error_codes::PRECONDITION_FAILED);
}

#[tokio::test]
async fn feed_reactions_over_http() {
    let app = TestApp::new();
    let group_id = create_hiking_group(&app, false).await;
    app.post("/groups/join", &bob(), json!({"group_id": group_id}))
        .await;

    let (status, body) = app
        .post(
            "/posts/create",
            &alice(),
            json!({"group_id": group_id, "text": "Trail run on sunday"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let post_id = body["resp_data"]["post_id"].as_str().unwrap().to_string();

    for who in [alice(), bob()] {
        let (status, _) = app
            .post(
                "/posts/react",
                &who,
                json!({"post_id": post_id, "kind": "like"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = app
        .get(&format!("/posts/feed?group_id={}", group_id), &bob())
        .await;
    let reactions = body["resp_data"][0]["reactions"].as_object().unwrap();
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions["like"].as_array().unwrap().len(), 2);

    let stranger = Identity::new("mallory", "Mallory");
    let (status, body) = app
        .post(
            "/posts/create",
            &stranger,
            json!({"group_id": group_id, "text": "spam"}),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], error_codes::NOT_A_MEMBER);
}

#[tokio::test]
async fn reconcile_requires_an_allow_listed_admin() {
    let app = TestApp::new();
    let group_id = create_hiking_group(&app, false).await;
    app.store.force_member_count(&group_id, 7).await;

    let (status, _) = app
        .call(Method::POST, "/admin/reconcile", Some(&alice()), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = Identity {
        uid: "ops".into(),
        display_name: "Ops".into(),
        email: "admin@smaaks.local".into(),
    };
    let (status, body) = app
        .call(Method::POST, "/admin/reconcile", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resp_data"]["member_counts_fixed"], 1);

    let group = app.store.get_group(&group_id).await.unwrap().unwrap();
    assert_eq!(group.stats.member_count, 1);

    let (_, body) = app
        .call(Method::POST, "/admin/reconcile", Some(&admin), None)
        .await;
    assert_eq!(body["resp_data"]["member_counts_fixed"], 0);
}

#[tokio::test]
async fn event_chat_and_suggestions() {
    let app = TestApp::new();
    let starts_at = chrono::Utc::now().timestamp_millis() + 2 * 24 * 3600 * 1000;
    let (status, body) = app
        .post(
            "/groups/create",
            &alice(),
            json!({
                "kind": "event",
                "name": "Padel doubles",
                "settings": {"max_members": 4},
                "event": {
                    "sport": "padel",
                    "skill_level": "all",
                    "location": "Lyon 7e",
                    "starts_at": starts_at
                }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let event_id = body["resp_data"]["group_id"].as_str().unwrap().to_string();

    app.post(
        "/profile/update",
        &bob(),
        json!({"favorite_sports": ["Padel"], "location": "lyon"}),
    )
    .await;
    let (_, body) = app.get("/events/suggestions", &bob()).await;
    assert_eq!(body["resp_data"][0]["group_id"], event_id.as_str());
    assert_eq!(body["resp_data"][0]["score"], 30 + 15 + 10 + 5 + 10);

    app.post("/groups/join", &bob(), json!({"group_id": event_id}))
        .await;
    let (_, body) = app.get("/events/suggestions", &bob()).await;
    assert!(body["resp_data"].as_array().unwrap().is_empty());

    let (status, body) = app
        .post(
            "/messages/create",
            &bob(),
            json!({"event_id": event_id, "content": "who brings balls?"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["resp_data"]["is_organizer"], false);
    let message_id = body["resp_data"]["message_id"].as_str().unwrap().to_string();

    let (status, _) = app
        .post(
            "/messages/report",
            &alice(),
            json!({"message_id": message_id, "reason": "spam"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app
        .post(
            "/messages/report",
            &alice(),
            json!({"message_id": message_id, "reason": "spam"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], error_codes::PRECONDITION_FAILED);

    let (status, _) = app
        .post(
            "/messages/moderate",
            &alice(),
            json!({"message_id": message_id, "action": "hide"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app
        .get(&format!("/messages/list?event_id={}", event_id), &bob())
        .await;
    assert!(body["resp_data"].as_array().unwrap().is_empty());
    let (_, body) = app
        .get(&format!("/messages/list?event_id={}", event_id), &alice())
        .await;
    assert_eq!(body["resp_data"][0]["status"], "hidden");
}
