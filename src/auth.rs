use async_trait::async_trait;
use pgwire::api::ClientInfo;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Client metadata key holding the credential set by
/// `SET SESSION AUTHORIZATION`.
pub const SESSION_TOKEN_KEY: &str = "bookmyroom.session_token";

/// Transport-level startup password shared by every connection. End-user
/// identity is carried separately by the session credential.
#[derive(Debug)]
pub struct BookMyRoomAuthSource {
    password: String,
}

impl BookMyRoomAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for BookMyRoomAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub fn session_token<C: ClientInfo>(client: &C) -> Option<String> {
    client.metadata().get(SESSION_TOKEN_KEY).cloned()
}

pub fn set_session_token<C: ClientInfo>(client: &mut C, token: String) {
    client.metadata_mut().insert(SESSION_TOKEN_KEY.to_string(), token);
}

pub fn clear_session_token<C: ClientInfo>(client: &mut C) {
    client.metadata_mut().remove(SESSION_TOKEN_KEY);
}
