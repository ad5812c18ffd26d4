use crate::{
    config::Config,
    services::{MessageService, SessionResolver},
    websocket::ConnectionRegistry,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub config: Arc<Config>,
    /// Resolves bearer tokens for `/ws` and `/message`
    pub sessions: Arc<dyn SessionResolver>,
    pub messages: Arc<MessageService>,
}
