use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::UserId;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password login. The user name must be the caller's numeric user id.
#[derive(Debug)]
pub struct RoomkeeperAuthSource {
    password: String,
}

impl RoomkeeperAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomkeeperAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if user.parse::<UserId>().is_err() {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user name must be a numeric user id, got {user:?}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
