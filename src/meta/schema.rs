//! SQLite schema definitions

/// Complete schema SQL for initialization
pub const SCHEMA_SQL: &str = r#"
-- Resource records, keyed by (resource_type, id)
CREATE TABLE IF NOT EXISTS resources (
    resource_type TEXT NOT NULL,
    id TEXT NOT NULL,
    author TEXT NOT NULL DEFAULT '',
    display_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    tags_json TEXT NOT NULL DEFAULT '[]',
    downloads INTEGER NOT NULL DEFAULT 0,
    likes INTEGER NOT NULL DEFAULT 0,
    upstream_last_modified TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    text_hash TEXT NOT NULL,
    embedding_state TEXT NOT NULL DEFAULT 'absent',
    stale INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (resource_type, id)
);

CREATE INDEX IF NOT EXISTS idx_resources_author ON resources(author COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_resources_last_seen ON resources(resource_type, last_seen_at);
CREATE INDEX IF NOT EXISTS idx_resources_embedding ON resources(embedding_state);

-- Lexical index; rowid mirrors resources.rowid
CREATE VIRTUAL TABLE IF NOT EXISTS resources_fts USING fts5(
    ident,
    display_name,
    author,
    description,
    tags,
    tokenize = 'unicode61'
);

-- Persisted embeddings, the source for vector index rebuilds
CREATE TABLE IF NOT EXISTS embeddings (
    resource_type TEXT NOT NULL,
    id TEXT NOT NULL,
    vector BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    model TEXT NOT NULL,
    text_hash TEXT NOT NULL,
    embedded_at TEXT NOT NULL,
    PRIMARY KEY (resource_type, id),
    FOREIGN KEY (resource_type, id) REFERENCES resources(resource_type, id)
);

-- Crawl cycle log
CREATE TABLE IF NOT EXISTS crawl_cycles (
    cycle_id TEXT PRIMARY KEY,
    resource_type_scope TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    items_seen INTEGER NOT NULL DEFAULT 0,
    items_new INTEGER NOT NULL DEFAULT 0,
    items_updated INTEGER NOT NULL DEFAULT 0,
    errors_count INTEGER NOT NULL DEFAULT 0,
    terminal_status TEXT NOT NULL,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_cycles_started ON crawl_cycles(started_at);

-- Scheduler tasks
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    scheduled_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    error TEXT,
    interval_secs INTEGER,
    params_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_tasks_kind ON tasks(kind, state);

-- Small key/value table for index generation bookkeeping
CREATE TABLE IF NOT EXISTS index_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;
