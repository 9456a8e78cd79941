//! Database access layer implementing the repository pattern for the
//! delivery ledger.
//!
//! The repository layer acts as an anti-corruption layer, translating between
//! domain models and database schemas. All database operations go through
//! these repositories; direct SQL outside this module is forbidden.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_records;

use crate::error::Result;

/// Container for repository instances providing unified database access.
///
/// Manages a shared connection pool and provides type-safe access to each
/// domain repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for delivery record operations.
    pub delivery_records: Arc<delivery_records::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self { delivery_records: Arc::new(delivery_records::Repository::new(pool)) }
    }

    /// Performs a health check on the database connection.
    ///
    /// Executes a simple query to verify connectivity. Backs the `/health`
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or the
    /// query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.delivery_records.pool()).await?;

        Ok(())
    }
}
