use async_trait::async_trait;

use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::models::User;
use crate::router::{AuthenticatedHandler, Command};

const DEFAULT_LIMIT: u32 = 2;

/// `browse [limit]`: newest posts from the feeds the current user follows.
pub struct Browse;

#[async_trait]
impl AuthenticatedHandler for Browse {
    async fn invoke(&self, state: &mut AppState, command: &Command, user: User) -> Result<()> {
        let limit = match command.args.as_slice() {
            [] => DEFAULT_LIMIT,
            [raw] => parse_limit(raw)?,
            _ => {
                return Err(AppError::Validation(
                    "too many arguments, usage: browse [limit]".to_string(),
                ))
            }
        };

        let posts = state.repository.get_posts_for_user(user.id, limit).await?;
        if posts.is_empty() {
            println!("No posts yet, follow some feeds and run 'agg'");
        }
        for post in posts {
            println!("{} from {}", post.published_at.format("%a %b %d %Y"), post.feed_name);
            println!("--- {} ---", post.title);
            if let Some(description) = &post.description {
                println!("    {}", description);
            }
            println!("Link: {}", post.url);
            println!("=====================================");
        }
        Ok(())
    }
}

fn parse_limit(raw: &str) -> Result<u32> {
    match raw.parse::<u32>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(AppError::Validation(format!(
            "invalid limit '{}', expected a positive number",
            raw
        ))),
    }
}
