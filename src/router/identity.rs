use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::models::User;

/// Look up the configured current user in the store.
///
/// Fails with `AppError::Unauthenticated` when no user is configured or the
/// configured name has no matching user.
pub async fn current_user(state: &AppState) -> Result<User> {
    let Some(name) = state.config.current_user_name.as_deref() else {
        return Err(AppError::Unauthenticated(
            "no current user, run 'register' or 'login' first".to_string(),
        ));
    };

    state
        .repository
        .get_user_by_name(name)
        .await?
        .ok_or_else(|| AppError::Unauthenticated(format!("user '{}' does not exist", name)))
}
