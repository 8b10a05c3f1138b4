use crate::config::Config;
use crate::db::Repository;
use crate::error::Result;
use crate::feed::FeedFetcher;

/// Everything a command handler can reach.
pub struct AppState {
    pub config: Config,
    pub repository: Repository,
    pub fetcher: FeedFetcher,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let repository = Repository::new(&config.db_path).await?;
        let fetcher = FeedFetcher::new()?;

        Ok(Self {
            config,
            repository,
            fetcher,
        })
    }
}
