//! Per-statement deadline enforcement.

use crate::error::{RepoError, RepoResult};
use rusqlite::Connection;
use std::time::Instant;

/// VM instructions between deadline checks.
const CHECK_INTERVAL_OPS: i32 = 1000;

/// Installs a progress handler that interrupts the running statement once
/// `deadline` passes. The handler is removed on drop.
pub(crate) struct DeadlineGuard<'c> {
    conn: &'c Connection,
    armed: bool,
}

impl<'c> DeadlineGuard<'c> {
    pub fn arm(conn: &'c Connection, deadline: Option<Instant>) -> RepoResult<Self> {
        let Some(deadline) = deadline else {
            return Ok(Self { conn, armed: false });
        };
        if Instant::now() >= deadline {
            return Err(RepoError::Timeout);
        }
        conn.progress_handler(
            CHECK_INTERVAL_OPS,
            Some(move || Instant::now() >= deadline),
        );
        Ok(Self { conn, armed: true })
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.progress_handler(0, None::<fn() -> bool>);
        }
    }
}
