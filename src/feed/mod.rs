mod fetcher;
#[cfg(test)]
pub(crate) mod mock_server;
mod rss;

pub use fetcher::FeedFetcher;
pub use rss::{RssFeed, RssItem};
