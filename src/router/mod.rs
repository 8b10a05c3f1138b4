//! Name-based command dispatch.
//!
//! Each command is registered as a [`Route`]: either public, or authenticated,
//! in which case the current user is resolved before the handler runs and the
//! handler is skipped entirely if that fails.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::models::User;

pub mod identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Exactly `N` arguments, or a validation error quoting `usage`.
    pub fn args<const N: usize>(&self, usage: &str) -> Result<[&str; N]> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        args.try_into().map_err(|args: Vec<&str>| {
            let usage = if usage.is_empty() {
                self.name.clone()
            } else {
                format!("{} {}", self.name, usage)
            };
            AppError::Validation(format!(
                "expected {} argument(s) but got {}, usage: {}",
                N,
                args.len(),
                usage
            ))
        })
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, state: &mut AppState, command: &Command) -> Result<()>;
}

#[async_trait]
pub trait AuthenticatedHandler: Send + Sync {
    async fn invoke(&self, state: &mut AppState, command: &Command, user: User) -> Result<()>;
}

pub enum Route {
    Public(Box<dyn Handler>),
    Authenticated(Box<dyn AuthenticatedHandler>),
}

impl Route {
    pub fn public(handler: impl Handler + 'static) -> Self {
        Route::Public(Box::new(handler))
    }

    pub fn authenticated(handler: impl AuthenticatedHandler + 'static) -> Self {
        Route::Authenticated(Box::new(handler))
    }

    pub fn requires_auth(&self) -> bool {
        matches!(self, Route::Authenticated(_))
    }
}

#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `route` under `name`, replacing any earlier registration.
    pub fn register(&mut self, name: &str, route: Route) {
        self.routes.insert(name.to_string(), route);
    }

    #[cfg(test)]
    pub fn requires_auth(&self, name: &str) -> Option<bool> {
        self.routes.get(name).map(Route::requires_auth)
    }

    /// Run the handler registered for `command.name`.
    ///
    /// Anything the route returns is prefixed with the command name.
    pub async fn run(&self, state: &mut AppState, command: &Command) -> Result<()> {
        let route = self
            .routes
            .get(&command.name)
            .ok_or_else(|| AppError::UnknownCommand(command.name.clone()))?;

        tracing::debug!(
            "Running '{}' with args {:?} (authenticated: {})",
            command.name,
            command.args,
            route.requires_auth()
        );

        let result = match route {
            Route::Public(handler) => handler.invoke(state, command).await,
            Route::Authenticated(handler) => match identity::current_user(state).await {
                Ok(user) => handler.invoke(state, command, user).await,
                Err(e) => Err(e),
            },
        };

        result.map_err(|e| e.context(command.name.as_str()))
    }
}
