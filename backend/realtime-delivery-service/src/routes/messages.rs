use crate::{error::AppError, middleware::guards::User, models::SendMessageRequest, state::AppState};
use actix_web::{post, web, HttpResponse};

/// POST /message
/// Create a message and hand it to the real-time path
///
/// Authorization: Requires membership in the conversation
#[post("/message")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let message = state
        .messages
        .send_message(user.id, body.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(message))
}
