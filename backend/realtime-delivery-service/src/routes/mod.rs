use actix_web::web;

pub mod health;
pub mod messages;
pub mod wsroute;

/// Mount every HTTP and WebSocket route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(wsroute::ws_handler)
        .service(messages::send_message)
        .service(health::health);
}
