//! Admin endpoints for media streams.
//!
//! Live streams are looked up through the provider by stream id; finished
//! calls are still reported from the session manager until cleaned up.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::media::Connection;

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    pub name: String,
}

fn live_stream(state: &AppState, stream_sid: &str) -> AppResult<Arc<Connection>> {
    state
        .provider
        .lookup(stream_sid)
        .ok_or_else(|| AppError::NotFound(format!("No live stream with id {}", stream_sid)))
}

pub async fn list_streams(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let live: Vec<_> = state.provider.connections().iter().map(|c| c.info()).collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "live": live,
        "sessions": state.sessions.list(),
        "summary": state.sessions.get_sessions_summary()
    })))
}

pub async fn get_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let stream_sid = path.into_inner();
    let connection = state.provider.lookup(&stream_sid).map(|c| c.info());
    let session = state.sessions.find_by_stream(&stream_sid).map(|s| s.summary());

    if connection.is_none() && session.is_none() {
        return Err(AppError::NotFound(format!("Unknown stream {}", stream_sid)));
    }

    Ok(HttpResponse::Ok().json(json!({
        "stream_sid": stream_sid,
        "live": connection.is_some(),
        "connection": connection,
        "session": session
    })))
}

pub async fn send_mark(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<MarkRequest>,
) -> AppResult<HttpResponse> {
    let stream_sid = path.into_inner();
    let MarkRequest { name } = body.into_inner();
    if name.trim().is_empty() {
        return Err(AppError::ValidationError("Mark name cannot be empty".to_string()));
    }

    let connection = live_stream(&state, &stream_sid)?;
    connection.send_mark(&name).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "stream_sid": stream_sid,
        "mark": name
    })))
}

pub async fn clear_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let stream_sid = path.into_inner();
    let connection = live_stream(&state, &stream_sid)?;
    connection.clear().await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "stream_sid": stream_sid
    })))
}

pub async fn close_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let stream_sid = path.into_inner();
    let connection = live_stream(&state, &stream_sid)?;
    let closed = connection.close().await;
    info!(stream_sid = %stream_sid, closed, "stream closed via admin API");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "stream_sid": stream_sid,
        "closed": closed
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::media::socket::testing::socket_pair;
    use actix_web::{http::StatusCode, test, App};
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    #[actix_web::test]
    async fn test_stream_admin_endpoints() {
        let state = web::Data::new(AppState::from_config(AppConfig::default()));
        let app = test::init_service(
            App::new().app_data(state.clone()).service(
                web::scope("/streams")
                    .route("", web::get().to(list_streams))
                    .route("/{stream_sid}", web::get().to(get_stream))
                    .route("/{stream_sid}", web::delete().to(close_stream))
                    .route("/{stream_sid}/mark", web::post().to(send_mark))
                    .route("/{stream_sid}/clear", web::post().to(clear_stream)),
            ),
        )
        .await;

        let (server, mut client) = socket_pair().await;
        state.provider.accept(server, "/media-stream", None).await.unwrap();
        let start = json!({"event": "start", "start": {"streamSid": "MZ-admin", "callSid": "CA-admin"}});
        client.send(Message::Text(start.to_string())).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while state.provider.lookup("MZ-admin").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let req = test::TestRequest::get().uri("/streams/MZ-admin").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["live"], true);
        assert_eq!(body["connection"]["state"], "active");
        assert_eq!(body["connection"]["identity"]["call_sid"], "CA-admin");

        let req = test::TestRequest::post()
            .uri("/streams/MZ-admin/mark")
            .set_json(json!({"name": "checkpoint"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        let message = client.next().await.unwrap().unwrap();
        let frame: serde_json::Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(frame["mark"]["name"], "checkpoint");

        let req = test::TestRequest::post()
            .uri("/streams/MZ-admin/mark")
            .set_json(json!({"name": "  "}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post().uri("/streams/MZ-admin/clear").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/streams").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["live"].as_array().map(Vec::len), Some(1));

        let req = test::TestRequest::delete().uri("/streams/MZ-admin").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["closed"], true);

        let req = test::TestRequest::get().uri("/streams/MZ-admin").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post().uri("/streams/MZ-admin/clear").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
