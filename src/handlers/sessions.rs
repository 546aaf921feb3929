//! Session administration: list live sessions, zero a session's state, or
//! close a session from outside its connection.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.pipeline.sessions().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// `POST /api/v1/sessions/{id}/reset`
pub async fn reset_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    if !state.pipeline.reset_session(&session_id).await {
        return Err(AppError::NotFound(format!("Session {} not found", session_id)));
    }

    info!(session_id = %session_id, "Session state reset via API");
    Ok(HttpResponse::Ok().json(json!({
        "status": "reset",
        "session_id": session_id
    })))
}

/// `DELETE /api/v1/sessions/{id}`
///
/// The connection itself stays open; its next frame starts from a fresh state.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    if !state.pipeline.close_session(&session_id).await {
        return Err(AppError::NotFound(format!("Session {} not found", session_id)));
    }

    info!(session_id = %session_id, "Session closed via API");
    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "session_id": session_id
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_session_lifecycle_over_http() {
        let state = test_state();
        state.pipeline.open_session("abc").await.unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/sessions", web::get().to(list_sessions))
                .route("/sessions/{id}/reset", web::post().to(reset_session))
                .route("/sessions/{id}", web::delete().to(close_session)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/sessions").to_request()).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["session_id"], "abc");

        let resp = test::call_service(&app, test::TestRequest::post().uri("/sessions/abc/reset").to_request()).await;
        assert!(resp.status().is_success());

        let resp = test::call_service(&app, test::TestRequest::delete().uri("/sessions/abc").to_request()).await;
        assert!(resp.status().is_success());
        assert!(!state.pipeline.registry().contains("abc").await);
        assert!(!state.pipeline.store().contains("abc").await);
    }

    #[actix_web::test]
    async fn test_unknown_session_is_not_found() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/sessions/{id}/reset", web::post().to(reset_session))
                .route("/sessions/{id}", web::delete().to(close_session)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::post().uri("/sessions/nope/reset").to_request()).await;
        assert_eq!(resp.status(), 404);

        let resp = test::call_service(&app, test::TestRequest::delete().uri("/sessions/nope").to_request()).await;
        assert_eq!(resp.status(), 404);
    }
}
