use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::Caller;

/// Connection user name that acts as the space admin. Any other user name
/// must be a member ULID.
pub const ADMIN_USER: &str = "admin";

/// Map a connection user name to the identity it acts as.
pub fn caller_from_user(user: &str) -> Option<Caller> {
    if user.eq_ignore_ascii_case(ADMIN_USER) {
        return Some(Caller::Admin);
    }
    Ulid::from_string(user).ok().map(Caller::Coworker)
}

/// Shared-password check. Real authentication happens upstream; this only
/// keeps stray clients out and rejects user names that name nobody.
#[derive(Debug)]
pub struct CoworkdAuthSource {
    password: String,
}

impl CoworkdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CoworkdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if caller_from_user(user).is_none() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("rejected login for unknown user {user:?}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user must be \"{ADMIN_USER}\" or a member id, got {user:?}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_and_member_users() {
        assert_eq!(caller_from_user("admin"), Some(Caller::Admin));
        assert_eq!(caller_from_user("ADMIN"), Some(Caller::Admin));

        let member = Ulid::new();
        assert_eq!(
            caller_from_user(&member.to_string()),
            Some(Caller::Coworker(member))
        );
    }

    #[test]
    fn anything_else_is_rejected() {
        assert_eq!(caller_from_user("postgres"), None);
        assert_eq!(caller_from_user(""), None);
    }
}
