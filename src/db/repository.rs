use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{FeedFollowDetails, Feed, FeedWithOwner, NewFeed, NewPost, PostWithFeed, User};

use super::schema::SCHEMA;

const USER_COLUMNS: &str = "u.id, u.name, u.created_at, u.updated_at";
const FEED_COLUMNS: &str =
    "f.id, f.name, f.url, f.user_id, f.created_at, f.updated_at, f.last_fetched_at";
const FOLLOW_DETAILS_SELECT: &str = r#"SELECT ff.id, ff.user_id, ff.feed_id, ff.created_at,
                                              f.name, f.url, u.name
                                       FROM feed_follows ff
                                       JOIN feeds f ON f.id = ff.feed_id
                                       JOIN users u ON u.id = ff.user_id"#;

/// SQLite-backed store for users, feeds, follows and posts.
pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // User operations

    pub async fn create_user(&self, name: &str) -> Result<User> {
        let name = name.to_string();
        let conflict = format!("user '{}'", name);
        let now = now();

        self.conn
            .call(move |conn| {
                let ts = format_timestamp(now);
                conn.execute(
                    "INSERT INTO users (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
                    params![name, ts],
                )?;
                Ok(User {
                    id: conn.last_insert_rowid(),
                    name,
                    created_at: now,
                    updated_at: now,
                })
            })
            .await
            .map_err(|e| conflict_or_database(e, conflict))
    }

    pub async fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let name = name.to_string();
        let user = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM users u WHERE u.name = ?1", USER_COLUMNS);
                let user = conn
                    .query_row(&sql, params![name], user_from_row)
                    .optional()?;
                Ok(user)
            })
            .await?;
        Ok(user)
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let users = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "SELECT {} FROM users u ORDER BY u.created_at, u.id",
                    USER_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let users = stmt
                    .query_map([], user_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(users)
            })
            .await?;
        Ok(users)
    }

    /// Delete every user. Feeds, follows and posts go with them.
    pub async fn delete_all_users(&self) -> Result<usize> {
        let deleted = self
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM users", [])?))
            .await?;
        Ok(deleted)
    }

    // Feed operations

    pub async fn create_feed(&self, feed: NewFeed) -> Result<Feed> {
        let conflict = format!("feed '{}'", feed.url);
        let now = now();

        self.conn
            .call(move |conn| {
                let ts = format_timestamp(now);
                conn.execute(
                    "INSERT INTO feeds (name, url, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![feed.name, feed.url, feed.user_id, ts],
                )?;
                Ok(Feed {
                    id: conn.last_insert_rowid(),
                    name: feed.name,
                    url: feed.url,
                    user_id: feed.user_id,
                    created_at: now,
                    updated_at: now,
                    last_fetched_at: None,
                })
            })
            .await
            .map_err(|e| conflict_or_database(e, conflict))
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let url = url.to_string();
        let feed = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM feeds f WHERE f.url = ?1", FEED_COLUMNS);
                let feed = conn.query_row(&sql, params![url], feed_from_row).optional()?;
                Ok(feed)
            })
            .await?;
        Ok(feed)
    }

    pub async fn get_feeds(&self) -> Result<Vec<FeedWithOwner>> {
        let feeds = self
            .conn
            .call(|conn| {
                let sql = format!(
                    r#"SELECT {}, u.name
                       FROM feeds f
                       JOIN users u ON u.id = f.user_id
                       ORDER BY f.created_at, f.id"#,
                    FEED_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let feeds = stmt
                    .query_map([], |row| {
                        Ok(FeedWithOwner {
                            feed: feed_from_row(row)?,
                            owner_name: row.get(7)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(feeds)
            })
            .await?;
        Ok(feeds)
    }

    /// The feed that has gone longest without a fetch. Never-fetched feeds come
    /// first; ties go to the feed created first.
    pub async fn get_next_feed_to_fetch(&self) -> Result<Option<Feed>> {
        let feed = self
            .conn
            .call(|conn| {
                let sql = format!(
                    r#"SELECT {}
                       FROM feeds f
                       ORDER BY f.last_fetched_at ASC NULLS FIRST, f.created_at ASC, f.id ASC
                       LIMIT 1"#,
                    FEED_COLUMNS
                );
                let feed = conn.query_row(&sql, [], feed_from_row).optional()?;
                Ok(feed)
            })
            .await?;
        Ok(feed)
    }

    /// Record a fetch of `id` at `at`. Returns false when the feed is missing or
    /// already carries a later fetch time, in which case nothing changes.
    pub async fn mark_feed_fetched(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let updated = self
            .conn
            .call(move |conn| {
                let ts = format_timestamp(at);
                let changed = conn.execute(
                    r#"UPDATE feeds SET last_fetched_at = ?2, updated_at = ?2
                       WHERE id = ?1 AND (last_fetched_at IS NULL OR last_fetched_at < ?2)"#,
                    params![id, ts],
                )?;
                Ok(changed > 0)
            })
            .await?;
        Ok(updated)
    }

    // Follow operations

    pub async fn create_feed_follow(&self, user_id: i64, feed_id: i64) -> Result<FeedFollowDetails> {
        let conflict = format!("follow of feed {} by user {}", feed_id, user_id);
        let now = now();

        self.conn
            .call(move |conn| {
                let ts = format_timestamp(now);
                conn.execute(
                    "INSERT INTO feed_follows (user_id, feed_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                    params![user_id, feed_id, ts],
                )?;
                let id = conn.last_insert_rowid();
                let sql = format!("{} WHERE ff.id = ?1", FOLLOW_DETAILS_SELECT);
                let follow = conn.query_row(&sql, params![id], follow_details_from_row)?;
                Ok(follow)
            })
            .await
            .map_err(|e| conflict_or_database(e, conflict))
    }

    pub async fn get_follows_for_user(&self, user_id: i64) -> Result<Vec<FeedFollowDetails>> {
        let follows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "{} WHERE ff.user_id = ?1 ORDER BY ff.created_at, ff.id",
                    FOLLOW_DETAILS_SELECT
                );
                let mut stmt = conn.prepare(&sql)?;
                let follows = stmt
                    .query_map(params![user_id], follow_details_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(follows)
            })
            .await?;
        Ok(follows)
    }

    /// Returns false if the user wasn't following the feed.
    pub async fn delete_feed_follow(&self, user_id: i64, feed_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM feed_follows WHERE user_id = ?1 AND feed_id = ?2",
                    params![user_id, feed_id],
                )?;
                Ok(changed > 0)
            })
            .await?;
        Ok(deleted)
    }

    // Post operations

    /// Insert a post. A post whose url is already stored fails with `AppError::Conflict`.
    pub async fn create_post(&self, post: NewPost) -> Result<i64> {
        let conflict = format!("post '{}'", post.url);
        let now = now();

        self.conn
            .call(move |conn| {
                let ts = format_timestamp(now);
                conn.execute(
                    r#"INSERT INTO posts (feed_id, title, url, description, published_at, created_at, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)"#,
                    params![
                        post.feed_id,
                        post.title,
                        post.url,
                        post.description,
                        format_timestamp(post.published_at),
                        ts,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(|e| conflict_or_database(e, conflict))
    }

    /// Newest posts across the feeds `user_id` follows.
    pub async fn get_posts_for_user(&self, user_id: i64, limit: u32) -> Result<Vec<PostWithFeed>> {
        let posts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT p.id, p.feed_id, f.name, p.title, p.url, p.description,
                              p.published_at, p.created_at
                       FROM posts p
                       JOIN feeds f ON f.id = p.feed_id
                       JOIN feed_follows ff ON ff.feed_id = p.feed_id
                       WHERE ff.user_id = ?1
                       ORDER BY p.published_at DESC, p.id DESC
                       LIMIT ?2"#,
                )?;
                let posts = stmt
                    .query_map(params![user_id, limit], post_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(posts)
            })
            .await?;
        Ok(posts)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so that string order is time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// Truncated to what the database keeps, so returned rows compare equal to re-read ones.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

fn optional_timestamp(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_timestamp(idx, &raw))
        .transpose()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn is_unique_violation(err: &tokio_rusqlite::Error) -> bool {
    match err {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

fn conflict_or_database(err: tokio_rusqlite::Error, what: String) -> AppError {
    if is_unique_violation(&err) {
        AppError::Conflict(what)
    } else {
        AppError::Database(err)
    }
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: timestamp(row, 2)?,
        updated_at: timestamp(row, 3)?,
    })
}

fn feed_from_row(row: &Row) -> rusqlite::Result<Feed> {
    Ok(Feed {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        user_id: row.get(3)?,
        created_at: timestamp(row, 4)?,
        updated_at: timestamp(row, 5)?,
        last_fetched_at: optional_timestamp(row, 6)?,
    })
}

fn follow_details_from_row(row: &Row) -> rusqlite::Result<FeedFollowDetails> {
    Ok(FeedFollowDetails {
        id: row.get(0)?,
        user_id: row.get(1)?,
        feed_id: row.get(2)?,
        created_at: timestamp(row, 3)?,
        feed_name: row.get(4)?,
        feed_url: row.get(5)?,
        user_name: row.get(6)?,
    })
}

fn post_from_row(row: &Row) -> rusqlite::Result<PostWithFeed> {
    Ok(PostWithFeed {
        id: row.get(0)?,
        feed_id: row.get(1)?,
        feed_name: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        description: row.get(5)?,
        published_at: timestamp(row, 6)?,
        created_at: timestamp(row, 7)?,
    })
}
