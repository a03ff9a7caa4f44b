use crate::auth::{self, require_auth};
use crate::handlers;
use crate::state::AppState;
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

pub const API_PREFIX: &str = "/api/auth";

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/groups",
            get(handlers::list_groups).post(handlers::create_group),
        )
        .route("/groups/stats", get(handlers::get_group_stats))
        .route(
            "/groups/:id/members",
            get(handlers::list_members)
                .post(handlers::add_member)
                .delete(handlers::clear_members),
        )
        .route("/members/:id", delete(handlers::delete_member))
        .route(
            "/members/:id/payments",
            get(handlers::payment_history).post(handlers::record_payment),
        )
        .route("/payments", get(handlers::list_payments))
        .route("/reports", get(handlers::get_report))
        .route(
            "/reminders/logs",
            get(handlers::list_reminder_logs).post(handlers::create_reminder_log),
        )
        .route("/reminders/send", post(handlers::send_reminders))
        .route(
            "/reminders/settings",
            get(handlers::get_reminder_settings)
                .post(handlers::update_reminder_settings)
                .put(handlers::update_reminder_settings),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public = Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/check", get(auth::check));

    Router::new()
        .route("/health", get(handlers::health))
        .nest(API_PREFIX, protected.merge(public))
        .with_state(state)
}
