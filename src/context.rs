//! Runtime context: no process-wide singletons.
//!
//! Everything a component needs beyond its own arguments — configuration,
//! the connection pool, the index-store HTTP client, and the top-level
//! cancellation signal — travels through an explicit [`Context`] built
//! once at startup and threaded into every constructor. No component
//! reaches for global state.

use tokio_util::sync::CancellationToken;

use crate::config::Settings;

/// Shared runtime context, cheaply cloneable (every field is itself a
/// handle: a pool, a client, a token).
#[derive(Clone)]
pub struct Context {
    pub settings: Settings,
    pub pool: deadpool_postgres::Pool,
    pub http_client: reqwest::Client,
    pub cancellation: CancellationToken,
}

impl Context {
    pub fn new(settings: Settings, pool: deadpool_postgres::Pool, http_client: reqwest::Client) -> Self {
        Self {
            settings,
            pool,
            http_client,
            cancellation: CancellationToken::new(),
        }
    }

    /// A child token tied to the process-wide cancellation signal, for a
    /// single long-lived task (reader/subscriber/applier/checkpointer)
    /// to observe independently while still being cancelled as a group.
    pub fn child_cancellation(&self) -> CancellationToken {
        self.cancellation.child_token()
    }
}
