use async_trait::async_trait;

use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::models::User;
use crate::router::{Command, Handler};

/// `login <name>`: switch the current user to an existing one.
pub struct Login;

#[async_trait]
impl Handler for Login {
    async fn invoke(&self, state: &mut AppState, command: &Command) -> Result<()> {
        let [name] = command.args::<1>("<name>")?;

        let user = state
            .repository
            .get_user_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user '{}'", name)))?;
        state.config.set_user(&user.name)?;

        println!("User set to '{}'", user.name);
        Ok(())
    }
}

/// `register <name>`: create a user and make it the current one.
pub struct Register;

#[async_trait]
impl Handler for Register {
    async fn invoke(&self, state: &mut AppState, command: &Command) -> Result<()> {
        let [name] = command.args::<1>("<name>")?;

        if state.repository.get_user_by_name(name).await?.is_some() {
            return Err(AppError::Conflict(format!("user '{}'", name)));
        }
        let user = state.repository.create_user(name).await?;
        state.config.set_user(&user.name)?;

        tracing::debug!("Registered user {} ({})", user.name, user.id);
        println!("User '{}' registered and logged in", user.name);
        Ok(())
    }
}

/// `reset`: delete every user, and with them all feeds, follows and posts.
pub struct Reset;

#[async_trait]
impl Handler for Reset {
    async fn invoke(&self, state: &mut AppState, command: &Command) -> Result<()> {
        let [] = command.args::<0>("")?;

        let deleted = state.repository.delete_all_users().await?;
        tracing::info!("Deleted {} users", deleted);
        println!("database reset");
        Ok(())
    }
}

pub struct Users;

#[async_trait]
impl Handler for Users {
    async fn invoke(&self, state: &mut AppState, command: &Command) -> Result<()> {
        let [] = command.args::<0>("")?;

        let current = state.config.current_user_name.as_deref();
        for user in state.repository.get_users().await? {
            println!("{}", user_line(&user, current));
        }
        Ok(())
    }
}

fn user_line(user: &User, current: Option<&str>) -> String {
    if Some(user.name.as_str()) == current {
        format!("{}: {} (current)", user.id, user.name)
    } else {
        format!("{}: {}", user.id, user.name)
    }
}
