use async_trait::async_trait;

use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::models::{Feed, User};
use crate::router::{AuthenticatedHandler, Command};

pub struct Follow;

#[async_trait]
impl AuthenticatedHandler for Follow {
    async fn invoke(&self, state: &mut AppState, command: &Command, user: User) -> Result<()> {
        let [url] = command.args::<1>("<url>")?;
        let feed = feed_by_url(state, url).await?;

        let follow = state
            .repository
            .create_feed_follow(user.id, feed.id)
            .await
            .map_err(|e| match e {
                AppError::Conflict(_) => AppError::Conflict(format!(
                    "follow of '{}' by '{}'",
                    feed.url, user.name
                )),
                other => other,
            })?;

        println!("Feed Name:\t{}", follow.feed_name);
        println!("User Name:\t{}", follow.user_name);
        Ok(())
    }
}

pub struct Following;

#[async_trait]
impl AuthenticatedHandler for Following {
    async fn invoke(&self, state: &mut AppState, command: &Command, user: User) -> Result<()> {
        let [] = command.args::<0>("")?;

        let follows = state.repository.get_follows_for_user(user.id).await?;
        if follows.is_empty() {
            println!("'{}' isn't following any feeds", user.name);
        }
        for follow in follows {
            println!("Feed Name:\t{}", follow.feed_name);
            println!("Feed URL:\t{}", follow.feed_url);
            println!("---");
        }
        Ok(())
    }
}

pub struct Unfollow;

#[async_trait]
impl AuthenticatedHandler for Unfollow {
    async fn invoke(&self, state: &mut AppState, command: &Command, user: User) -> Result<()> {
        let [url] = command.args::<1>("<url>")?;
        let feed = feed_by_url(state, url).await?;

        if !state.repository.delete_feed_follow(user.id, feed.id).await? {
            return Err(AppError::NotFound(format!(
                "follow of '{}' by '{}'",
                feed.url, user.name
            )));
        }

        println!("Unfollowed '{}'", feed.name);
        Ok(())
    }
}

async fn feed_by_url(state: &AppState, url: &str) -> Result<Feed> {
    state
        .repository
        .get_feed_by_url(url)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("feed '{}'", url)))
}
