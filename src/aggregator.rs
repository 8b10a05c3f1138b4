//! The `agg` loop: every tick claims the feed that has waited longest, marks it
//! fetched, downloads it and stores any posts not seen before.
//!
//! The claim and the mark are two separate statements, so two aggregators
//! running against the same database can both claim one feed. Only a single
//! aggregator process per database is supported.

use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::time::{Interval, MissedTickBehavior};

use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::feed::{FeedFetcher, RssItem};
use crate::models::{Feed, NewPost};

/// Shortest accepted interval between ticks.
pub const MIN_INTERVAL: Duration = Duration::from_secs(10);

/// `pubDate` layout, e.g. `Mon, 02 Jan 2006 15:04:05 -0700`.
pub const PUB_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// What happened to the items of one fetched feed.
///
/// `undated` counts items whose publish date didn't parse; they are still
/// stored (with the Unix epoch) and also counted as inserted or duplicate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub undated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No feeds to fetch.
    Idle,
    FetchFailed { feed_id: i64 },
    Merged { feed_id: i64, report: MergeReport },
}

pub struct Aggregator<'a> {
    repository: &'a Repository,
    fetcher: &'a FeedFetcher,
    fetch_timeout: Duration,
}

impl<'a> Aggregator<'a> {
    pub fn new(repository: &'a Repository, fetcher: &'a FeedFetcher, fetch_timeout: Duration) -> Self {
        Self {
            repository,
            fetcher,
            fetch_timeout,
        }
    }

    /// Tick now and then every `interval` until the process exits.
    ///
    /// Ticks follow the wall clock: a slow tick doesn't push later ones back,
    /// and ticks missed while busy are dropped rather than run back to back.
    /// Only returns early, with `AppError::Config`, for an interval below
    /// [`MIN_INTERVAL`].
    pub async fn run(&self, interval: Duration) -> Result<()> {
        if interval < MIN_INTERVAL {
            return Err(AppError::Config(format!(
                "interval {:?} is too short, it must be at least {:?}",
                interval, MIN_INTERVAL
            )));
        }

        tracing::info!("Collecting feeds every {:?}", interval);
        self.collect_every(interval).await
    }

    async fn collect_every(&self, interval: Duration) -> Result<()> {
        let mut ticker = ticker(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!("Aggregation tick failed: {}", e);
            }
        }
    }

    /// Claim, mark, fetch and merge a single feed.
    ///
    /// Errors are store failures during the claim; a feed that can't be fetched
    /// is reported as [`TickOutcome::FetchFailed`] and keeps its new fetch time.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let Some(feed) = self.repository.get_next_feed_to_fetch().await? else {
            tracing::debug!("No feeds to fetch");
            return Ok(TickOutcome::Idle);
        };

        // Marked before the request so a hanging feed isn't claimed again next tick.
        if !self.repository.mark_feed_fetched(feed.id, Utc::now()).await? {
            tracing::debug!("Feed '{}' already carries a later fetch time", feed.name);
        }

        let document = match self.fetcher.fetch(&feed.url, self.fetch_timeout).await {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Failed to fetch feed '{}' ({}): {}", feed.name, feed.url, e);
                return Ok(TickOutcome::FetchFailed { feed_id: feed.id });
            }
        };

        let report = self.merge(&feed, &document.channel.items).await;
        tracing::info!(
            "Fetched feed '{}': {} new, {} already stored, {} skipped, {} failed",
            feed.name,
            report.inserted,
            report.duplicates,
            report.skipped,
            report.failed
        );

        Ok(TickOutcome::Merged {
            feed_id: feed.id,
            report,
        })
    }

    /// Store each item as a post. Problems with one item are logged and
    /// counted; they never stop the remaining items.
    async fn merge(&self, feed: &Feed, items: &[RssItem]) -> MergeReport {
        let mut report = MergeReport::default();

        for item in items {
            if item.link.is_empty() {
                tracing::warn!("Skipping item '{}' of feed '{}': no link", item.title, feed.name);
                report.skipped += 1;
                continue;
            }

            let published_at = match parse_pub_date(&item.pub_date) {
                Ok(published_at) => published_at,
                Err(e) => {
                    tracing::warn!("{}; storing {} with the epoch as its publish date", e, item.link);
                    report.undated += 1;
                    DateTime::<Utc>::from(UNIX_EPOCH)
                }
            };

            let post = NewPost {
                feed_id: feed.id,
                title: item.title.clone(),
                url: item.link.clone(),
                description: Some(item.description.clone()).filter(|d| !d.is_empty()),
                published_at,
            };

            match self.repository.create_post(post).await {
                Ok(_) => report.inserted += 1,
                Err(AppError::Conflict(_)) => report.duplicates += 1,
                Err(e) => {
                    tracing::error!("Failed to store post {}: {}", item.link, e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// First tick is immediate; ticks missed while a slow one runs are dropped.
fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

pub fn parse_pub_date(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(raw.trim(), PUB_DATE_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Decode(format!("invalid publish date '{}': {}", raw, e)))
}

/// Parse an interval such as `30s`, `1m` or `1h30m`.
///
/// One or more `<number><unit>` pairs with an optional leading sign; numbers
/// may have a fraction (`1.5s`, `.5s`) and units are `ns`, `us` (or `µs`),
/// `ms`, `s`, `m` and `h`. A bare `0` is zero. Negative intervals are rejected
/// since a `Duration` can't hold them.
pub fn parse_interval(input: &str) -> Result<Duration> {
    let invalid = || {
        AppError::Validation(format!(
            "invalid interval '{}', expected e.g. 30s, 1m or 1h30m",
            input
        ))
    };

    let mut rest = input.trim();
    let negative = rest.starts_with('-');
    if let Some(unsigned) = rest.strip_prefix(['-', '+']) {
        rest = unsigned;
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(number_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);

        let value: f64 = number.parse().map_err(|_| invalid())?;
        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        let nanos = (value * nanos_per_unit).round();
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Err(invalid());
        }
        total = total
            .checked_add(Duration::from_nanos(nanos as u64))
            .ok_or_else(invalid)?;
        rest = tail;
    }

    if negative && !total.is_zero() {
        return Err(AppError::Validation(format!(
            "invalid interval '{}', it must not be negative",
            input
        )));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::db::repository::tests::test_repository;
    use crate::feed::mock_server::{refused_url, rss_document, MockServer};
    use crate::models::NewFeed;

    const GOOD_DATE: &str = "Mon, 02 Jan 2006 15:04:05 -0700";

    async fn add_followed_feed(repo: &Repository, user_id: i64, name: &str, url: &str) -> Feed {
        let feed = repo
            .create_feed(NewFeed {
                name: name.to_string(),
                url: url.to_string(),
                user_id,
            })
            .await
            .unwrap();
        repo.create_feed_follow(user_id, feed.id).await.unwrap();
        feed
    }

    #[test]
    fn parses_reference_date_to_utc() {
        let parsed = assert_ok!(parse_pub_date(GOOD_DATE));
        assert_eq!(parsed, Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap());
    }

    #[test]
    fn malformed_date_is_a_decode_error() {
        for raw in ["", "yesterday", "2006-01-02T15:04:05Z", "Mon, 02 Jan 2006 15:04:05 GMT"] {
            let err = assert_err!(parse_pub_date(raw));
            assert!(matches!(err, AppError::Decode(_)), "{:?}", raw);
        }
    }

    #[test]
    fn parses_intervals() {
        assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval(".5s").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("+1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_interval("-0").unwrap(), Duration::ZERO);
        assert_eq!(parse_interval("-0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_intervals() {
        for raw in ["", "+", "-", "10", "m", "5x", "-1m", "1m30", "1..5s", ".s", "+-1m"] {
            let err = assert_err!(parse_interval(raw));
            assert!(matches!(err, AppError::Validation(_)), "{:?}", raw);
        }
    }

    #[tokio::test]
    async fn run_rejects_short_interval() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        let err = assert_err!(aggregator.run(Duration::from_secs(9)).await);
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn zero_interval_is_too_short() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        let err = assert_err!(aggregator.run(parse_interval("0").unwrap()).await);
        assert!(matches!(err, AppError::Config(_)));
    }

    async fn fetched_count(repo: &Repository) -> usize {
        repo.get_feeds()
            .await
            .unwrap()
            .iter()
            .filter(|f| f.feed.last_fetched_at.is_some())
            .count()
    }

    #[tokio::test]
    async fn loop_ticks_at_once_then_once_per_interval_past_failures() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let server = MockServer::start().await;
        let alice = repo.create_user("alice").await.unwrap();

        add_followed_feed(&repo, alice.id, "broken", &refused_url().await).await;
        for name in ["a", "b"] {
            let link = format!("http://{}/1", name);
            let url = server.route(
                &format!("/{}.xml", name),
                200,
                &rss_document(name, &[(name, &link, GOOD_DATE)]),
            );
            add_followed_feed(&repo, alice.id, name, &url).await;
        }
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));
        let interval = Duration::from_millis(600);

        let observe = async {
            let started = tokio::time::Instant::now();
            let mut seen = Vec::new();
            while seen.len() < 3 {
                let count = fetched_count(&repo).await;
                if seen.last() != Some(&count) && count > 0 {
                    seen.push(count);
                }
                assert!(started.elapsed() < Duration::from_secs(10), "stalled at {:?}", seen);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            (seen, started.elapsed())
        };

        let (seen, elapsed) = tokio::select! {
            result = aggregator.collect_every(interval) => panic!("loop returned {:?}", result),
            observed = observe => observed,
        };

        // The refused feed fails on the first tick and the loop carries on.
        assert_eq!(seen, vec![1, 2, 3]);
        // Ticks at 0, 600 and 1200 ms.
        assert!(elapsed >= interval * 2, "three ticks after {:?}", elapsed);
        let posts = repo.get_posts_for_user(alice.id, 10).await.unwrap();
        assert_eq!(posts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ticks_are_skipped() {
        let mut ticker = ticker(Duration::from_secs(10));
        let start = tokio::time::Instant::now();

        assert_eq!(ticker.tick().await, start);
        // A tick that overruns by more than two periods.
        tokio::time::advance(Duration::from_secs(25)).await;
        ticker.tick().await;
        let next = ticker.tick().await;

        assert_eq!(next - start, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn tick_without_feeds_is_idle() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        assert_eq!(aggregator.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn malformed_date_still_stores_post() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let server = MockServer::start().await;
        let url = server.route(
            "/feed.xml",
            200,
            &rss_document(
                "Blog",
                &[
                    ("Dated", "http://blog/dated", GOOD_DATE),
                    ("Undated", "http://blog/undated", "sometime last week"),
                ],
            ),
        );
        let alice = repo.create_user("alice").await.unwrap();
        let feed = add_followed_feed(&repo, alice.id, "blog", &url).await;
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        let outcome = aggregator.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Merged {
                feed_id: feed.id,
                report: MergeReport {
                    inserted: 2,
                    undated: 1,
                    ..MergeReport::default()
                },
            }
        );
        let posts = repo.get_posts_for_user(alice.id, 10).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].url, "http://blog/dated");
        assert_eq!(posts[0].description.as_deref(), Some("About Dated"));
        assert_eq!(posts[1].url, "http://blog/undated");
        assert_eq!(posts[1].published_at, DateTime::<Utc>::from(UNIX_EPOCH));
    }

    #[tokio::test]
    async fn same_item_twice_is_stored_once() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let server = MockServer::start().await;
        let url = server.route(
            "/feed.xml",
            200,
            &rss_document("Blog", &[("First", "http://blog/1", GOOD_DATE)]),
        );
        let alice = repo.create_user("alice").await.unwrap();
        add_followed_feed(&repo, alice.id, "blog", &url).await;
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        aggregator.tick().await.unwrap();

        // The feed gains a second item; the first one comes round again.
        server.route(
            "/feed.xml",
            200,
            &rss_document(
                "Blog",
                &[("First", "http://blog/1", GOOD_DATE), ("Second", "http://blog/2", GOOD_DATE)],
            ),
        );
        let outcome = aggregator.tick().await.unwrap();

        let report = match outcome {
            TickOutcome::Merged { report, .. } => report,
            other => panic!("expected a merge, got {:?}", other),
        };
        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
        let posts = repo.get_posts_for_user(alice.id, 10).await.unwrap();
        assert_eq!(posts.len(), 2);
    }

    #[tokio::test]
    async fn items_without_link_are_skipped() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let server = MockServer::start().await;
        let url = server.route(
            "/feed.xml",
            200,
            &rss_document("Blog", &[("No link", "", GOOD_DATE), ("Linked", "http://blog/1", GOOD_DATE)]),
        );
        let alice = repo.create_user("alice").await.unwrap();
        add_followed_feed(&repo, alice.id, "blog", &url).await;
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        let report = match aggregator.tick().await.unwrap() {
            TickOutcome::Merged { report, .. } => report,
            other => panic!("expected a merge, got {:?}", other),
        };

        assert_eq!(report.skipped, 1);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn ticks_rotate_through_feeds_and_never_rewind() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let server = MockServer::start().await;
        let alice = repo.create_user("alice").await.unwrap();

        let mut feeds = Vec::new();
        for name in ["a", "b", "c"] {
            let path = format!("/{}.xml", name);
            let link = format!("http://{}/1", name);
            let url = server.route(&path, 200, &rss_document(name, &[(name, &link, GOOD_DATE)]));
            feeds.push(add_followed_feed(&repo, alice.id, name, &url).await);
        }
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        let mut claimed = Vec::new();
        let mut previous: Vec<Option<DateTime<Utc>>> = vec![None; feeds.len()];
        for _ in 0..5 {
            match aggregator.tick().await.unwrap() {
                TickOutcome::Merged { feed_id, .. } => claimed.push(feed_id),
                other => panic!("unexpected outcome {:?}", other),
            }

            let current: Vec<_> = repo
                .get_feeds()
                .await
                .unwrap()
                .into_iter()
                .map(|f| f.feed.last_fetched_at)
                .collect();
            for (before, after) in previous.iter().zip(&current) {
                if let Some(before) = before {
                    assert!(after.unwrap() >= *before);
                }
            }
            previous = current;
        }

        let ids: Vec<_> = feeds.iter().map(|f| f.id).collect();
        assert_eq!(claimed, vec![ids[0], ids[1], ids[2], ids[0], ids[1]]);
        assert!(previous.iter().all(Option::is_some));
        assert_eq!(repo.get_posts_for_user(alice.id, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_fetch_still_consumes_the_slot() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let server = MockServer::start().await;
        let alice = repo.create_user("alice").await.unwrap();

        let broken = add_followed_feed(&repo, alice.id, "broken", &refused_url().await).await;
        let good_url = server.route(
            "/feed.xml",
            200,
            &rss_document("Good", &[("Post", "http://good/1", GOOD_DATE)]),
        );
        let good = add_followed_feed(&repo, alice.id, "good", &good_url).await;
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        assert_eq!(
            aggregator.tick().await.unwrap(),
            TickOutcome::FetchFailed { feed_id: broken.id }
        );
        let stored = repo.get_feed_by_url(&broken.url).await.unwrap().unwrap();
        assert!(stored.last_fetched_at.is_some());

        let outcome = aggregator.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Merged { feed_id, .. } if feed_id == good.id));
    }

    #[tokio::test]
    async fn bad_document_is_a_failed_fetch() {
        let (_dir, repo) = test_repository().await;
        let fetcher = FeedFetcher::without_proxy().unwrap();
        let server = MockServer::start().await;
        let url = server.route("/feed.xml", 200, "<html>not a feed</html>");
        let alice = repo.create_user("alice").await.unwrap();
        let feed = add_followed_feed(&repo, alice.id, "html", &url).await;
        let aggregator = Aggregator::new(&repo, &fetcher, Duration::from_secs(5));

        assert_eq!(
            aggregator.tick().await.unwrap(),
            TickOutcome::FetchFailed { feed_id: feed.id }
        );
        assert!(repo.get_posts_for_user(alice.id, 10).await.unwrap().is_empty());
    }
}
