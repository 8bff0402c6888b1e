use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    AppState,
    middleware::{admin_middleware, auth_middleware, log_errors},
    routes::{admin, chat, feed, group, profile, suggestion},
    utils::success_to_api_response,
};

async fn health() -> axum::Json<crate::utils::ApiResponse<&'static str>> {
    success_to_api_response("ok")
}

fn group_routes() -> Router<AppState> {
    Router::new()
        .route("/groups/create", post(group::create_group))
        .route("/groups/by-id", get(group::find_by_id))
        .route("/groups/mine", get(group::my_groups))
        .route("/groups/update", post(group::update_group))
        .route("/groups/delete", post(group::delete_group))
        .route("/groups/join", post(group::join_group))
        .route("/groups/leave", post(group::leave_group))
        .route("/groups/cancel-request", post(group::cancel_request))
        .route("/groups/requests", get(group::list_requests))
        .route("/groups/requests/respond", post(group::respond_to_request))
        .route("/groups/members", get(group::get_group_members))
        .route("/groups/members/remove", post(group::remove_group_member))
        .route("/groups/members/role", post(group::set_member_role))
}

fn feed_routes() -> Router<AppState> {
    Router::new()
        .route("/posts/create", post(feed::create_post))
        .route("/posts/feed", get(feed::get_feed))
        .route("/posts/feed/stream", get(feed::stream_feed))
        .route("/posts/react", post(feed::react))
        .route("/posts/pin", post(feed::pin_post))
        .route("/posts/unpin", post(feed::unpin_post))
        .route("/posts/delete", post(feed::delete_post))
        .route("/posts/comments/create", post(feed::add_comment))
        .route("/posts/comments", get(feed::list_comments))
        .route("/posts/comments/delete", post(feed::delete_comment))
}

fn chat_routes() -> Router<AppState> {
    Router::new()
        .route("/messages/create", post(chat::post_message))
        .route("/messages/list", get(chat::list_messages))
        .route("/messages/stream", get(chat::stream_messages))
        .route("/messages/report", post(chat::report_message))
        .route("/messages/moderate", post(chat::moderate_message))
        .route("/messages/delete", post(chat::delete_message))
}

/// All API routes nested under the configured base URI. Rate limiting and
/// CORS are added by the binary.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .merge(group_routes())
        .merge(feed_routes())
        .merge(chat_routes())
        .route("/profile", get(profile::get_profile))
        .route("/profile/update", post(profile::update_profile))
        .route("/events/suggestions", get(suggestion::get_suggestions))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let admin_routes = Router::new()
        .route("/admin/reconcile", post(admin::reconcile))
        .layer(from_fn_with_state(state.clone(), admin_middleware));

    Router::new()
        .nest(
            &state.config.api_base_uri,
            Router::new()
                .merge(public_routes)
                .merge(protected_routes)
                .merge(admin_routes),
        )
        .layer(from_fn(log_errors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
