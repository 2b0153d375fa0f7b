//! SQL access. Queries that participate in a multi-step write take the
//! caller's transaction; plain reads run on the pool.

mod conversations;
mod idempotency;
mod messages;

use sqlx::PgPool;

#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
