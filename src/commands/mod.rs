mod browse;
mod feeds;
mod follows;
mod users;

use crate::router::{Route, Router};

/// The router with every gator command installed.
pub fn router() -> Router {
    let mut router = Router::new();

    router.register("login", Route::public(users::Login));
    router.register("register", Route::public(users::Register));
    router.register("reset", Route::public(users::Reset));
    router.register("users", Route::public(users::Users));
    router.register("agg", Route::public(feeds::Agg));
    router.register("addfeed", Route::authenticated(feeds::AddFeed));
    router.register("feeds", Route::public(feeds::Feeds));
    router.register("follow", Route::authenticated(follows::Follow));
    router.register("following", Route::authenticated(follows::Following));
    router.register("unfollow", Route::authenticated(follows::Unfollow));
    router.register("browse", Route::authenticated(browse::Browse));

    router
}
