use async_trait::async_trait;
use url::Url;

use crate::aggregator::{parse_interval, Aggregator};
use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::models::{NewFeed, User};
use crate::router::{AuthenticatedHandler, Command, Handler};

/// `agg <interval>`: run the aggregator until the process is stopped.
pub struct Agg;

#[async_trait]
impl Handler for Agg {
    async fn invoke(&self, state: &mut AppState, command: &Command) -> Result<()> {
        let [interval] = command.args::<1>("<interval>")?;
        let interval = parse_interval(interval)?;

        Aggregator::new(&state.repository, &state.fetcher, state.config.fetch_timeout())
            .run(interval)
            .await
    }
}

/// `addfeed <name> <url>`: add a feed owned by, and followed by, the current user.
pub struct AddFeed;

#[async_trait]
impl AuthenticatedHandler for AddFeed {
    async fn invoke(&self, state: &mut AppState, command: &Command, user: User) -> Result<()> {
        let [name, url] = command.args::<2>("<name> <url>")?;
        validate_feed_url(url)?;

        let feed = state
            .repository
            .create_feed(NewFeed {
                name: name.to_string(),
                url: url.to_string(),
                user_id: user.id,
            })
            .await?;
        state.repository.create_feed_follow(user.id, feed.id).await?;

        println!("Added feed '{}'", feed.name);
        println!("URL:\t{}", feed.url);
        println!("User:\t{}", user.name);
        Ok(())
    }
}

pub struct Feeds;

#[async_trait]
impl Handler for Feeds {
    async fn invoke(&self, state: &mut AppState, command: &Command) -> Result<()> {
        let [] = command.args::<0>("")?;

        let feeds = state.repository.get_feeds().await?;
        if feeds.is_empty() {
            println!("No feeds yet");
        }
        for entry in feeds {
            println!("Name:\t{}", entry.feed.name);
            println!("URL:\t{}", entry.feed.url);
            println!("User:\t{}", entry.owner_name);
            println!("---");
        }
        Ok(())
    }
}

fn validate_feed_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("invalid feed url '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(AppError::Validation(format!(
            "invalid feed url '{}': unsupported scheme '{}'",
            raw, scheme
        ))),
    }
}
