//! HTTP surface: health, message creation and the WebSocket upgrade.

mod common;

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use common::{
    member, test_bus, InMemoryMessageRepository, InMemoryPresence, StaticMembership,
    StaticSessions,
};
use realtime_delivery_service::config::Config;
use realtime_delivery_service::routes;
use realtime_delivery_service::services::{MessagePublisher, MessageService};
use realtime_delivery_service::state::AppState;
use realtime_delivery_service::websocket::ConnectionRegistry;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

struct Fixture {
    state: AppState,
    conversation: Uuid,
    user: Uuid,
    repo: Arc<InMemoryMessageRepository>,
}

const TOKEN: &str = "valid-session-token";

fn fixture() -> Fixture {
    let conversation = Uuid::new_v4();
    let user = Uuid::new_v4();

    let membership = StaticMembership::new();
    membership.add(member(conversation, user, "Dan"));
    let sessions = StaticSessions::new();
    sessions.insert(TOKEN, user);
    let repo = InMemoryMessageRepository::new();

    let state = AppState {
        registry: ConnectionRegistry::new(InMemoryPresence::new()),
        config: Arc::new(Config::default()),
        sessions,
        messages: Arc::new(MessageService::new(
            repo.clone(),
            membership,
            MessagePublisher::new(test_bus()),
        )),
    };

    Fixture {
        state,
        conversation,
        user,
        repo,
    }
}

#[actix_web::test]
async fn test_health_reports_instance_and_connections() {
    let fx = fixture();
    let instance_id = fx.state.config.instance_id.clone();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(fx.state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(body["status"], "ok");
    assert_eq!(body["instance_id"], instance_id);
    assert_eq!(body["connections"], 0);
}

#[actix_web::test]
async fn test_post_message_requires_session() {
    let fx = fixture();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(fx.state))
            .configure(routes::configure),
    )
    .await;

    let payload = json!({ "conversation_id": fx.conversation, "body": "hi" });

    let req = test::TestRequest::post()
        .uri("/message")
        .set_json(&payload)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri("/message")
        .insert_header(("Authorization", "Bearer not-a-session"))
        .set_json(&payload)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    assert!(fx.repo.stored().is_empty());
}

#[actix_web::test]
async fn test_post_message_creates_message() {
    let fx = fixture();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(fx.state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/message")
        .insert_header(("Authorization", format!("Bearer {TOKEN}")))
        .set_json(json!({ "conversation_id": fx.conversation, "body": "hi" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["body"], "hi");
    assert_eq!(body["type"], "text");
    assert_eq!(body["user_id"], fx.user.to_string());
    assert_eq!(fx.repo.stored().len(), 1);
}

#[actix_web::test]
async fn test_post_message_to_foreign_conversation_is_forbidden() {
    let fx = fixture();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(fx.state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/message")
        .insert_header(("Authorization", format!("Bearer {TOKEN}")))
        .set_json(json!({ "conversation_id": Uuid::new_v4(), "body": "hi" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], 403);
}

#[actix_web::test]
async fn test_ws_upgrade_requires_session() {
    let fx = fixture();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(fx.state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/ws").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_ws_upgrade_registers_connection() {
    let fx = fixture();
    let registry = fx.state.registry.clone();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(fx.state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri(&format!("/ws?token={TOKEN}"))
        .insert_header(("Upgrade", "websocket"))
        .insert_header(("Connection", "Upgrade"))
        .insert_header(("Sec-WebSocket-Version", "13"))
        .insert_header(("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(registry.connection_count(fx.user), 1);
}
