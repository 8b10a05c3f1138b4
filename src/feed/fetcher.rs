use std::time::Duration;

use html_escape::decode_html_entities;
use reqwest::{Client, ClientBuilder};

use crate::error::Result;

use super::rss::{self, RssFeed};

const USER_AGENT: &str = "gator";

pub struct FeedFetcher {
    client: Client,
}

impl FeedFetcher {
    pub fn new() -> Result<Self> {
        Self::from_builder(Client::builder())
    }

    #[cfg(test)]
    pub(crate) fn without_proxy() -> Result<Self> {
        Self::from_builder(Client::builder().no_proxy())
    }

    fn from_builder(builder: ClientBuilder) -> Result<Self> {
        let client = builder
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }

    /// Fetch and decode the RSS document at `url` in a single attempt.
    ///
    /// Transport failures, timeouts and non-success statuses come back as
    /// `AppError::Network`; a body that isn't RSS comes back as `AppError::Decode`.
    /// The channel title and description have HTML entities unescaped; items are
    /// returned untouched.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<RssFeed> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        let bytes = response.bytes().await?;
        let mut feed = rss::parse(&bytes)?;

        let channel = &mut feed.channel;
        channel.title = decode_html_entities(&channel.title).into_owned();
        channel.description = decode_html_entities(&channel.description).into_owned();

        tracing::debug!("Fetched {} items from {}", channel.items.len(), url);
        Ok(feed)
    }
}
