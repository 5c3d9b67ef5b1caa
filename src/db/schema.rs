// db/schema.rs
// Database schema and migrations

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Run all schema setup and migrations.
///
/// Called during database initialization. This function is idempotent -
/// it checks for existing tables/columns before making changes.
pub fn run_all_migrations(conn: &Connection) -> Result<()> {
    // Create base tables
    conn.execute_batch(SCHEMA)?;

    // Run migrations in order
    migrate_sessions_git_commit_timestamp(conn)?;
    migrate_participants_mturk_ids(conn)?;

    Ok(())
}

/// Add git_commit_timestamp to sessions created before run replication
/// tracking existed. The column records the code version a session ran
/// under so the run can be reproduced later.
pub fn migrate_sessions_git_commit_timestamp(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "sessions", "git_commit_timestamp", "TEXT")
}

/// Add MTurk assignment/worker columns to participant rows created before
/// MTurk integration.
pub fn migrate_participants_mturk_ids(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "session_participants", "mturk_assignment_id", "TEXT")?;
    add_column_if_missing(conn, "session_participants", "mturk_worker_id", "TEXT")?;
    Ok(())
}

/// Check whether a table already carries a column
pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    column_def: &str,
) -> Result<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    info!("Migrating {} to add {} column", table, column);
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_def),
        [],
    )?;
    Ok(())
}

pub const SCHEMA: &str = r#"
-- ═══════════════════════════════════════
-- CORE: Sessions
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    session_type TEXT,
    label TEXT,
    code TEXT UNIQUE NOT NULL,
    experimenter_id INTEGER REFERENCES session_experimenters(id) ON DELETE SET NULL,
    time_started TEXT,
    first_subsession_id INTEGER REFERENCES subsessions(id) ON DELETE SET NULL,
    is_for_mturk INTEGER NOT NULL DEFAULT 1,
    mturk_payment_was_sent INTEGER NOT NULL DEFAULT 0,
    hidden INTEGER NOT NULL DEFAULT 0,
    git_commit_timestamp TEXT,
    base_pay INTEGER NOT NULL DEFAULT 0,   -- show-up fee, in cents
    comment TEXT NOT NULL DEFAULT '',
    participants_assigned INTEGER NOT NULL DEFAULT 0,
    special_category TEXT,                 -- test session, demo session, etc.
    demo_already_used INTEGER NOT NULL DEFAULT 0,
    ready INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- ═══════════════════════════════════════
-- STAGES: Subsessions and treatments
-- ═══════════════════════════════════════
-- One row per experiment stage. app_label tags which experiment app the
-- stage belongs to; next/previous pointers form the session's chain.
CREATE TABLE IF NOT EXISTS subsessions (
    id INTEGER PRIMARY KEY,
    session_id INTEGER REFERENCES sessions(id) ON DELETE SET NULL,
    app_label TEXT NOT NULL,
    label TEXT,
    index_in_subsessions INTEGER NOT NULL DEFAULT 0,
    next_subsession_id INTEGER REFERENCES subsessions(id) ON DELETE SET NULL,
    previous_subsession_id INTEGER REFERENCES subsessions(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_subsessions_session ON subsessions(session_id);

CREATE TABLE IF NOT EXISTS treatments (
    id INTEGER PRIMARY KEY,
    subsession_id INTEGER NOT NULL REFERENCES subsessions(id) ON DELETE CASCADE,
    session_id INTEGER REFERENCES sessions(id) ON DELETE SET NULL,
    label TEXT
);
CREATE INDEX IF NOT EXISTS idx_treatments_subsession ON treatments(subsession_id);

-- Per-subsession actor records. Each session participant/experimenter has
-- one row per subsession; me_in_next/previous pointers form the parallel
-- chain walked for payoffs.
CREATE TABLE IF NOT EXISTS subsession_users (
    id INTEGER PRIMARY KEY,
    subsession_id INTEGER NOT NULL REFERENCES subsessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN ('participant', 'experimenter')),
    payoff INTEGER,                        -- cents; NULL until computed
    session_participant_id INTEGER REFERENCES session_participants(id) ON DELETE SET NULL,
    session_experimenter_id INTEGER REFERENCES session_experimenters(id) ON DELETE SET NULL,
    me_in_next_id INTEGER REFERENCES subsession_users(id) ON DELETE SET NULL,
    me_in_previous_id INTEGER REFERENCES subsession_users(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_subsession_users_subsession ON subsession_users(subsession_id);

-- ═══════════════════════════════════════
-- ACTORS: Session participants and experimenters
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS session_participants (
    id INTEGER PRIMARY KEY,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    code TEXT UNIQUE NOT NULL,
    visited INTEGER NOT NULL DEFAULT 0,
    last_request_succeeded INTEGER,        -- NULL until the first request lands
    ip_address TEXT,
    is_on_wait_page INTEGER NOT NULL DEFAULT 0,
    current_page TEXT,
    vars TEXT NOT NULL DEFAULT '{}',
    index_in_subsessions INTEGER NOT NULL DEFAULT 0,
    me_in_first_id INTEGER REFERENCES subsession_users(id) ON DELETE SET NULL,
    exclude_from_data_analysis INTEGER NOT NULL DEFAULT 0,
    time_started TEXT,
    mturk_assignment_id TEXT,
    mturk_worker_id TEXT,
    label TEXT                             -- assigned by the experimenter; unique per session by convention
);
CREATE INDEX IF NOT EXISTS idx_participants_session ON session_participants(session_id);

CREATE TABLE IF NOT EXISTS session_experimenters (
    id INTEGER PRIMARY KEY,
    code TEXT UNIQUE NOT NULL,
    visited INTEGER NOT NULL DEFAULT 0,
    last_request_succeeded INTEGER,
    ip_address TEXT,
    is_on_wait_page INTEGER NOT NULL DEFAULT 0,
    current_page TEXT,
    vars TEXT NOT NULL DEFAULT '{}',
    index_in_subsessions INTEGER NOT NULL DEFAULT 0,
    me_in_first_id INTEGER REFERENCES subsession_users(id) ON DELETE SET NULL
);

-- ═══════════════════════════════════════
-- GLOBAL: Site-wide singleton
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS global_data (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    open_session_id INTEGER REFERENCES sessions(id) ON DELETE SET NULL
);
"#;
