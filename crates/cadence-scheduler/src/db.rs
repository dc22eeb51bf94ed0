use rusqlite::Connection;

use crate::error::Result;

/// Initialise the anchor schema in `conn`.
///
/// One row per job name; `anchor` is an RFC 3339 UTC timestamp with
/// nanosecond precision so it round-trips exactly.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_anchors (
            job_name    TEXT    NOT NULL PRIMARY KEY,
            anchor      TEXT    NOT NULL,   -- RFC 3339, UTC
            updated_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
