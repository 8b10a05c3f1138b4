mod feed;
mod follow;
mod post;
mod user;

pub use feed::{Feed, FeedWithOwner, NewFeed};
pub use follow::FeedFollowDetails;
pub use post::{NewPost, PostWithFeed};
pub use user::User;
