use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::agents::types::{
    AgentRecord, AgentState, Direction, MessageKind, Platform, ReputationCounters, UnifiedMessage,
};

/// Configuration for the persistence layer
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub database_path: String,
    pub max_connections: usize,
    pub retention_days: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: "swarmhub.db".to_string(),
            max_connections: 10,
            retention_days: 90,
        }
    }
}

/// Fixed-size set of WAL-mode SQLite connections.
///
/// Every connection is opened at construction and the checkout gate is a
/// semaphore sized to the set, so a granted permit always finds an idle
/// connection waiting. Queries are short by design (reads are
/// cursor-paginated), which is why a fixed cap with no overflow path is
/// enough here.
pub struct SqlitePool {
    idle: Mutex<Vec<Connection>>,
    gate: Semaphore,
}

impl SqlitePool {
    pub fn open(database_path: &str, connections: usize) -> Result<Self> {
        let connections = connections.max(1);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let mut idle = Vec::with_capacity(connections);
        for _ in 0..connections {
            let conn = Connection::open_with_flags(database_path, flags)
                .with_context(|| format!("Failed to open database: {}", database_path))?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "cache_size", "-64000")?;
            conn.pragma_update(None, "temp_store", "memory")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            idle.push(conn);
        }

        info!(connections, database_path = %database_path, "SQLite pool opened");
        Ok(Self {
            idle: Mutex::new(idle),
            gate: Semaphore::new(connections),
        })
    }

    /// Check a connection out, run the closure, put it back. The connection
    /// returns to the set on the error path too.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("sqlite pool closed"))?;

        let mut conn = self
            .idle
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("sqlite pool has a permit but no idle connection"))?;

        let result = f(&mut conn);
        self.idle.lock().unwrap().push(conn);
        result
    }

    /// Like `run`, inside one transaction that commits only on success.
    pub async fn run_tx<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }
}

/// Row shape for a persisted flow definition.
#[derive(Debug, Clone)]
pub struct FlowRow {
    pub flow_id: String,
    pub agent_id: String,
    pub definition: serde_json::Value,
    pub active: bool,
    pub updated_at: i64,
}

/// Row shape for a persisted execution.
#[derive(Debug, Clone)]
pub struct ExecutionRow {
    pub execution_id: String,
    pub flow_id: String,
    pub agent_id: String,
    pub status: String,
    pub trigger_event: serde_json::Value,
    pub variables: serde_json::Value,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub error_kind: Option<String>,
    pub error_node: Option<String>,
    pub resumption_token: Option<String>,
    pub wake_at: Option<i64>,
}

/// AI usage record written on stream completion.
#[derive(Debug, Clone)]
pub struct AiUsageRow {
    pub provider_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: f64,
    pub latency_ms: u64,
}

/// Main persistence layer over the shared relational store.
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(config: PersistenceConfig) -> Result<Self> {
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let pool = SqlitePool::open(&config.database_path, config.max_connections)?;

        let persistence = Self { pool };
        persistence.initialize_schema().await?;

        info!("Persistence layer initialized at {}", config.database_path);
        Ok(persistence)
    }

    async fn initialize_schema(&self) -> Result<()> {
        self.pool
            .run(|conn| {
                conn.execute_batch(
                    r#"
                CREATE TABLE IF NOT EXISTS agents (
                    agent_id TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    platform TEXT NOT NULL,
                    transport_config TEXT NOT NULL DEFAULT '{}',
                    tenant TEXT NOT NULL,
                    browser_session TEXT,
                    swarm_enabled INTEGER NOT NULL DEFAULT 0,
                    successful_handoffs INTEGER NOT NULL DEFAULT 0,
                    contributed_learnings INTEGER NOT NULL DEFAULT 0,
                    state TEXT NOT NULL DEFAULT 'created',
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    agent_id TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    platform TEXT NOT NULL,
                    direction TEXT NOT NULL,
                    chat_id TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    sender_name TEXT NOT NULL,
                    body TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    has_media INTEGER NOT NULL DEFAULT 0,
                    from_me INTEGER NOT NULL DEFAULT 0,
                    reply_to TEXT,
                    meta TEXT NOT NULL DEFAULT '{}',
                    PRIMARY KEY (agent_id, message_id)
                );
                CREATE INDEX IF NOT EXISTS idx_messages_agent_chat_ts
                    ON messages(agent_id, chat_id, timestamp);

                CREATE TABLE IF NOT EXISTS message_tombstones (
                    agent_id TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    new_body TEXT,
                    applied_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tombstones_agent_msg
                    ON message_tombstones(agent_id, message_id);

                CREATE TABLE IF NOT EXISTS flows (
                    flow_id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL,
                    definition TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_flows_agent ON flows(agent_id);

                CREATE TABLE IF NOT EXISTS executions (
                    execution_id TEXT PRIMARY KEY,
                    flow_id TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    trigger_event TEXT NOT NULL DEFAULT '{}',
                    variables TEXT NOT NULL DEFAULT '{}',
                    started_at INTEGER NOT NULL,
                    finished_at INTEGER,
                    error_kind TEXT,
                    error_node TEXT,
                    resumption_token TEXT,
                    wake_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_executions_agent ON executions(agent_id, started_at);
                CREATE INDEX IF NOT EXISTS idx_executions_wake ON executions(wake_at)
                    WHERE wake_at IS NOT NULL;

                CREATE TABLE IF NOT EXISTS node_results (
                    execution_id TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    result TEXT NOT NULL,
                    completed_at INTEGER NOT NULL,
                    PRIMARY KEY (execution_id, node_id)
                );

                CREATE TABLE IF NOT EXISTS ai_usage (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider_id TEXT NOT NULL,
                    model TEXT NOT NULL,
                    input_tokens INTEGER NOT NULL,
                    output_tokens INTEGER NOT NULL,
                    cost_estimate REAL NOT NULL DEFAULT 0,
                    latency_ms INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS provider_health (
                    provider_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    consecutive_errors INTEGER NOT NULL DEFAULT 0,
                    last_latency_ms INTEGER,
                    last_probe_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS cli_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider_id TEXT NOT NULL,
                    command TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    finished_at INTEGER,
                    exit_code INTEGER
                );

                CREATE TABLE IF NOT EXISTS media_metadata (
                    agent_id TEXT NOT NULL,
                    content_key TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    original_name TEXT,
                    size INTEGER NOT NULL,
                    first_seen_at INTEGER NOT NULL,
                    PRIMARY KEY (agent_id, content_key)
                );
                "#,
                )?;
                Ok(())
            })
            .await?;

        // Forward-only migrations: add columns missing from older databases.
        self.ensure_column("agents", "browser_session", "TEXT").await?;
        self.ensure_column("agents", "successful_handoffs", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column("agents", "contributed_learnings", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column("executions", "resumption_token", "TEXT").await?;
        self.ensure_column("executions", "wake_at", "INTEGER").await?;

        Ok(())
    }

    async fn ensure_column(&self, table: &str, column: &str, decl: &str) -> Result<()> {
        let table = table.to_string();
        let column = column.to_string();
        let decl = decl.to_string();

        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
                let existing: Vec<String> = stmt
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<std::result::Result<_, _>>()?;
                drop(stmt);

                if !existing.iter().any(|c| c == &column) {
                    debug!("Adding missing column {}.{}", table, column);
                    conn.execute(
                        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
                        [],
                    )?;
                }
                Ok(())
            })
            .await
    }

    // ---- agents ----

    pub async fn upsert_agent(&self, record: &AgentRecord) -> Result<()> {
        let record = record.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    r#"INSERT INTO agents
                       (agent_id, display_name, platform, transport_config, tenant, browser_session,
                        swarm_enabled, successful_handoffs, contributed_learnings, state, created_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                       ON CONFLICT(agent_id) DO UPDATE SET
                         display_name = excluded.display_name,
                         transport_config = excluded.transport_config,
                         browser_session = excluded.browser_session,
                         swarm_enabled = excluded.swarm_enabled,
                         state = excluded.state"#,
                    params![
                        record.agent_id,
                        record.display_name,
                        record.platform.as_str(),
                        serde_json::to_string(&record.transport_config)?,
                        record.tenant,
                        record.browser_session,
                        record.swarm_enabled as i64,
                        record.reputation.successful_handoffs as i64,
                        record.reputation.contributed_learnings as i64,
                        record.state.as_str(),
                        record.created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let agent_id = agent_id.to_string();

        self.pool
            .run(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT agent_id, display_name, platform, transport_config, tenant,
                                browser_session, swarm_enabled, successful_handoffs,
                                contributed_learnings, state, created_at
                         FROM agents WHERE agent_id = ?1",
                        params![agent_id],
                        row_to_agent,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    pub async fn list_agents(&self, tenant: &str) -> Result<Vec<AgentRecord>> {
        let tenant = tenant.to_string();

        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_id, display_name, platform, transport_config, tenant,
                            browser_session, swarm_enabled, successful_handoffs,
                            contributed_learnings, state, created_at
                     FROM agents WHERE tenant = ?1 ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map(params![tenant], row_to_agent)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn all_agents(&self) -> Result<Vec<AgentRecord>> {
        self.pool
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_id, display_name, platform, transport_config, tenant,
                            browser_session, swarm_enabled, successful_handoffs,
                            contributed_learnings, state, created_at
                     FROM agents ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map([], row_to_agent)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn update_agent_state(&self, agent_id: &str, state: AgentState) -> Result<()> {
        let agent_id = agent_id.to_string();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "UPDATE agents SET state = ?1 WHERE agent_id = ?2",
                    params![state.as_str(), agent_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let agent_id = agent_id.to_string();

        self.pool
            .run_tx(move |tx| {
                tx.execute("DELETE FROM agents WHERE agent_id = ?1", params![&agent_id])?;
                tx.execute("DELETE FROM messages WHERE agent_id = ?1", params![&agent_id])?;
                tx.execute("DELETE FROM flows WHERE agent_id = ?1", params![&agent_id])?;
                tx.execute(
                    "DELETE FROM media_metadata WHERE agent_id = ?1",
                    params![&agent_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn bump_reputation(&self, agent_id: &str, handoffs: u64, learnings: u64) -> Result<()> {
        let agent_id = agent_id.to_string();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "UPDATE agents SET successful_handoffs = successful_handoffs + ?1,
                            contributed_learnings = contributed_learnings + ?2
                     WHERE agent_id = ?3",
                    params![handoffs as i64, learnings as i64, agent_id],
                )?;
                Ok(())
            })
            .await
    }

    // ---- messages ----

    /// Insert a message. Returns false when the `(agent_id, message_id)` pair
    /// already exists; the duplicate is dropped.
    ///
    /// Timestamps are clamped so that per `(agent_id, chat_id)` the persisted
    /// sequence is non-decreasing even when a transport delivers skewed clocks.
    pub async fn insert_message(&self, message: &UnifiedMessage) -> Result<bool> {
        let message = message.clone();

        self.pool
            .run_tx(move |tx| {
                let last_ts: Option<i64> = tx
                    .query_row(
                        "SELECT MAX(timestamp) FROM messages WHERE agent_id = ?1 AND chat_id = ?2",
                        params![message.agent_id, message.chat_id],
                        |row| row.get::<_, Option<i64>>(0),
                    )
                    .optional()?
                    .flatten();

                let timestamp = match last_ts {
                    Some(last) if message.timestamp < last => last,
                    _ => message.timestamp,
                };

                let inserted = tx.execute(
                    r#"INSERT OR IGNORE INTO messages
                       (agent_id, message_id, platform, direction, chat_id, sender_id, sender_name,
                        body, timestamp, kind, has_media, from_me, reply_to, meta)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"#,
                    params![
                        message.agent_id,
                        message.id,
                        message.platform.as_str(),
                        message.direction.as_str(),
                        message.chat_id,
                        message.sender_id,
                        message.sender_name,
                        message.body,
                        timestamp,
                        message.kind.as_str(),
                        message.has_media as i64,
                        message.from_me as i64,
                        message.reply_to,
                        serde_json::to_string(&message.meta)?,
                    ],
                )?;
                Ok(inserted > 0)
            })
            .await
    }

    pub async fn message_exists(&self, agent_id: &str, message_id: &str) -> Result<bool> {
        let agent_id = agent_id.to_string();
        let message_id = message_id.to_string();

        self.pool
            .run(move |conn| {
                let found: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM messages WHERE agent_id = ?1 AND message_id = ?2",
                        params![agent_id, message_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await
    }

    /// Cursor-paginated read, newest first. The cursor is the `(timestamp, id)`
    /// pair of the last row the caller has seen.
    pub async fn get_messages(
        &self,
        agent_id: &str,
        chat_id: Option<&str>,
        cursor: Option<(i64, String)>,
        limit: usize,
    ) -> Result<Vec<UnifiedMessage>> {
        let agent_id = agent_id.to_string();
        let chat_id = chat_id.map(|c| c.to_string());
        let limit = limit.min(500) as i64;

        self.pool
            .run(move |conn| {
                let mut sql = String::from(
                    "SELECT agent_id, message_id, platform, direction, chat_id, sender_id,
                            sender_name, body, timestamp, kind, has_media, from_me, reply_to, meta
                     FROM messages WHERE agent_id = ?1",
                );
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(agent_id)];

                if let Some(chat) = chat_id {
                    sql.push_str(&format!(" AND chat_id = ?{}", args.len() + 1));
                    args.push(Box::new(chat));
                }
                if let Some((ts, id)) = cursor {
                    sql.push_str(&format!(
                        " AND (timestamp < ?{n} OR (timestamp = ?{n} AND message_id < ?{m}))",
                        n = args.len() + 1,
                        m = args.len() + 2
                    ));
                    args.push(Box::new(ts));
                    args.push(Box::new(id));
                }
                sql.push_str(&format!(
                    " ORDER BY timestamp DESC, message_id DESC LIMIT ?{}",
                    args.len() + 1
                ));
                args.push(Box::new(limit));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                        row_to_message,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Last `k` messages for each of the most recently active chats of an
    /// agent. Used for subscriber snapshots.
    pub async fn recent_messages_by_chat(
        &self,
        agent_id: &str,
        chats: usize,
        k: usize,
    ) -> Result<Vec<UnifiedMessage>> {
        let agent_id = agent_id.to_string();

        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chat_id, MAX(timestamp) AS last_ts FROM messages
                     WHERE agent_id = ?1 GROUP BY chat_id ORDER BY last_ts DESC LIMIT ?2",
                )?;
                let chat_ids: Vec<String> = stmt
                    .query_map(params![agent_id, chats as i64], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<_, _>>()?;
                drop(stmt);

                let mut out = Vec::new();
                for chat in chat_ids {
                    let mut stmt = conn.prepare(
                        "SELECT agent_id, message_id, platform, direction, chat_id, sender_id,
                                sender_name, body, timestamp, kind, has_media, from_me, reply_to, meta
                         FROM messages WHERE agent_id = ?1 AND chat_id = ?2
                         ORDER BY timestamp DESC, message_id DESC LIMIT ?3",
                    )?;
                    let mut rows = stmt
                        .query_map(params![agent_id, chat, k as i64], row_to_message)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows.reverse();
                    out.extend(rows);
                }
                Ok(out)
            })
            .await
    }

    /// Edits and deletes never rewrite history; they append tombstones.
    pub async fn append_tombstone(
        &self,
        agent_id: &str,
        message_id: &str,
        action: &str,
        new_body: Option<&str>,
    ) -> Result<bool> {
        let agent_id = agent_id.to_string();
        let message_id = message_id.to_string();
        let action = action.to_string();
        let new_body = new_body.map(|b| b.to_string());

        self.pool
            .run_tx(move |tx| {
                // Out-of-order edit referencing an unknown message is a no-op.
                let known: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM messages WHERE agent_id = ?1 AND message_id = ?2",
                        params![&agent_id, &message_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if known.is_none() {
                    warn!(agent_id = %agent_id, message_id = %message_id,
                          "Tombstone for unknown message dropped");
                    return Ok(false);
                }

                tx.execute(
                    "INSERT INTO message_tombstones (agent_id, message_id, action, new_body, applied_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        agent_id,
                        message_id,
                        action,
                        new_body,
                        crate::agents::types::now_ms()
                    ],
                )?;
                Ok(true)
            })
            .await
    }

    // ---- flows ----

    pub async fn save_flow(&self, row: &FlowRow) -> Result<()> {
        let row = row.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO flows (flow_id, agent_id, definition, active, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(flow_id) DO UPDATE SET
                       definition = excluded.definition,
                       active = excluded.active,
                       updated_at = excluded.updated_at",
                    params![
                        row.flow_id,
                        row.agent_id,
                        serde_json::to_string(&row.definition)?,
                        row.active as i64,
                        row.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<Option<FlowRow>> {
        let flow_id = flow_id.to_string();

        self.pool
            .run(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT flow_id, agent_id, definition, active, updated_at
                         FROM flows WHERE flow_id = ?1",
                        params![flow_id],
                        row_to_flow,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    pub async fn list_flows(&self, agent_id: &str) -> Result<Vec<FlowRow>> {
        let agent_id = agent_id.to_string();

        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT flow_id, agent_id, definition, active, updated_at
                     FROM flows WHERE agent_id = ?1 ORDER BY updated_at DESC",
                )?;
                let rows = stmt
                    .query_map(params![agent_id], row_to_flow)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn all_flows(&self) -> Result<Vec<FlowRow>> {
        self.pool
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT flow_id, agent_id, definition, active, updated_at FROM flows",
                )?;
                let rows = stmt
                    .query_map([], row_to_flow)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn set_flow_active(&self, flow_id: &str, active: bool) -> Result<bool> {
        let flow_id = flow_id.to_string();

        self.pool
            .run(move |conn| {
                let changed = conn.execute(
                    "UPDATE flows SET active = ?1 WHERE flow_id = ?2",
                    params![active as i64, flow_id],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn delete_flow(&self, flow_id: &str) -> Result<bool> {
        let flow_id = flow_id.to_string();

        self.pool
            .run(move |conn| {
                let changed =
                    conn.execute("DELETE FROM flows WHERE flow_id = ?1", params![flow_id])?;
                Ok(changed > 0)
            })
            .await
    }

    // ---- executions ----

    pub async fn insert_execution(&self, row: &ExecutionRow) -> Result<()> {
        let row = row.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    r#"INSERT INTO executions
                       (execution_id, flow_id, agent_id, status, trigger_event, variables,
                        started_at, finished_at, error_kind, error_node, resumption_token, wake_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
                    params![
                        row.execution_id,
                        row.flow_id,
                        row.agent_id,
                        row.status,
                        serde_json::to_string(&row.trigger_event)?,
                        serde_json::to_string(&row.variables)?,
                        row.started_at,
                        row.finished_at,
                        row.error_kind,
                        row.error_node,
                        row.resumption_token,
                        row.wake_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Claim a suspended execution for resumption. Returns false when the
    /// row is not suspended anymore, so a duplicate wake-up is a no-op.
    pub async fn claim_resumption(&self, execution_id: &str) -> Result<bool> {
        let execution_id = execution_id.to_string();

        self.pool
            .run(move |conn| {
                let changed = conn.execute(
                    "UPDATE executions SET status = 'running', wake_at = NULL
                     WHERE execution_id = ?1 AND status = 'suspended'",
                    params![execution_id],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn finish_execution(
        &self,
        execution_id: &str,
        status: &str,
        error_kind: Option<&str>,
        error_node: Option<&str>,
    ) -> Result<()> {
        let execution_id = execution_id.to_string();
        let status = status.to_string();
        let error_kind = error_kind.map(|s| s.to_string());
        let error_node = error_node.map(|s| s.to_string());

        self.pool
            .run(move |conn| {
                conn.execute(
                    "UPDATE executions SET status = ?1, finished_at = ?2, error_kind = ?3,
                            error_node = ?4, resumption_token = NULL, wake_at = NULL
                     WHERE execution_id = ?5",
                    params![
                        status,
                        crate::agents::types::now_ms(),
                        error_kind,
                        error_node,
                        execution_id
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Persist a suspension point so the scheduler can resume the execution,
    /// across process restarts if necessary.
    pub async fn suspend_execution(
        &self,
        execution_id: &str,
        token: &str,
        variables: &serde_json::Value,
        wake_at: i64,
    ) -> Result<()> {
        let execution_id = execution_id.to_string();
        let token = token.to_string();
        let variables = variables.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "UPDATE executions SET status = 'suspended', resumption_token = ?1,
                            variables = ?2, wake_at = ?3
                     WHERE execution_id = ?4",
                    params![token, serde_json::to_string(&variables)?, wake_at, execution_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRow>> {
        let execution_id = execution_id.to_string();

        self.pool
            .run(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT execution_id, flow_id, agent_id, status, trigger_event, variables,
                                started_at, finished_at, error_kind, error_node, resumption_token, wake_at
                         FROM executions WHERE execution_id = ?1",
                        params![execution_id],
                        row_to_execution,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    pub async fn list_executions(
        &self,
        agent_id: &str,
        cursor: Option<(i64, String)>,
        limit: usize,
    ) -> Result<Vec<ExecutionRow>> {
        let agent_id = agent_id.to_string();
        let limit = limit.min(200) as i64;

        self.pool
            .run(move |conn| {
                let rows = match cursor {
                    Some((ts, id)) => {
                        let mut stmt = conn.prepare(
                            "SELECT execution_id, flow_id, agent_id, status, trigger_event, variables,
                                    started_at, finished_at, error_kind, error_node, resumption_token, wake_at
                             FROM executions WHERE agent_id = ?1
                               AND (started_at < ?2 OR (started_at = ?2 AND execution_id < ?3))
                             ORDER BY started_at DESC, execution_id DESC LIMIT ?4",
                        )?;
                        let rows = stmt
                            .query_map(params![agent_id, ts, id, limit], row_to_execution)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT execution_id, flow_id, agent_id, status, trigger_event, variables,
                                    started_at, finished_at, error_kind, error_node, resumption_token, wake_at
                             FROM executions WHERE agent_id = ?1
                             ORDER BY started_at DESC, execution_id DESC LIMIT ?2",
                        )?;
                        let rows = stmt
                            .query_map(params![agent_id, limit], row_to_execution)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }

    /// Suspended executions whose wake time has passed. Replayed at boot and
    /// polled by the scheduler.
    pub async fn due_resumptions(&self, now: i64) -> Result<Vec<ExecutionRow>> {
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, flow_id, agent_id, status, trigger_event, variables,
                            started_at, finished_at, error_kind, error_node, resumption_token, wake_at
                     FROM executions
                     WHERE status = 'suspended' AND wake_at IS NOT NULL AND wake_at <= ?1
                     ORDER BY wake_at",
                )?;
                let rows = stmt
                    .query_map(params![now], row_to_execution)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn save_node_result(
        &self,
        execution_id: &str,
        node_id: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        let execution_id = execution_id.to_string();
        let node_id = node_id.to_string();
        let result = result.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO node_results (execution_id, node_id, result, completed_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        execution_id,
                        node_id,
                        serde_json::to_string(&result)?,
                        crate::agents::types::now_ms()
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn load_node_results(
        &self,
        execution_id: &str,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let execution_id = execution_id.to_string();

        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT node_id, result FROM node_results
                     WHERE execution_id = ?1 ORDER BY completed_at",
                )?;
                let rows = stmt
                    .query_map(params![execution_id], |row| {
                        let node_id: String = row.get(0)?;
                        let raw: String = row.get(1)?;
                        Ok((node_id, raw))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut out = Vec::with_capacity(rows.len());
                for (node_id, raw) in rows {
                    let value = serde_json::from_str(&raw)
                        .with_context(|| format!("corrupt node result for {}", node_id))?;
                    out.push((node_id, value));
                }
                Ok(out)
            })
            .await
    }

    // ---- AI usage, provider health, CLI sessions ----

    pub async fn record_ai_usage(&self, row: &AiUsageRow) -> Result<()> {
        let row = row.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO ai_usage
                     (provider_id, model, input_tokens, output_tokens, cost_estimate, latency_ms, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.provider_id,
                        row.model,
                        row.input_tokens as i64,
                        row.output_tokens as i64,
                        row.cost_estimate,
                        row.latency_ms as i64,
                        crate::agents::types::now_ms(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn upsert_provider_health(
        &self,
        provider_id: &str,
        status: &str,
        consecutive_errors: u32,
        last_latency_ms: Option<u64>,
        last_probe_at: Option<i64>,
    ) -> Result<()> {
        let provider_id = provider_id.to_string();
        let status = status.to_string();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO provider_health
                     (provider_id, status, consecutive_errors, last_latency_ms, last_probe_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(provider_id) DO UPDATE SET
                       status = excluded.status,
                       consecutive_errors = excluded.consecutive_errors,
                       last_latency_ms = excluded.last_latency_ms,
                       last_probe_at = excluded.last_probe_at",
                    params![
                        provider_id,
                        status,
                        consecutive_errors as i64,
                        last_latency_ms.map(|v| v as i64),
                        last_probe_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn record_cli_session(&self, provider_id: &str, command: &str) -> Result<i64> {
        let provider_id = provider_id.to_string();
        let command = command.to_string();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO cli_sessions (provider_id, command, started_at) VALUES (?1, ?2, ?3)",
                    params![provider_id, command, crate::agents::types::now_ms()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn finish_cli_session(&self, session_id: i64, exit_code: Option<i32>) -> Result<()> {
        self.pool
            .run(move |conn| {
                conn.execute(
                    "UPDATE cli_sessions SET finished_at = ?1, exit_code = ?2 WHERE id = ?3",
                    params![crate::agents::types::now_ms(), exit_code, session_id],
                )?;
                Ok(())
            })
            .await
    }

    // ---- media metadata ----

    pub async fn upsert_media_metadata(
        &self,
        agent_id: &str,
        content_key: &str,
        mime_type: &str,
        original_name: Option<&str>,
        size: u64,
    ) -> Result<()> {
        let agent_id = agent_id.to_string();
        let content_key = content_key.to_string();
        let mime_type = mime_type.to_string();
        let original_name = original_name.map(|s| s.to_string());

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO media_metadata
                     (agent_id, content_key, mime_type, original_name, size, first_seen_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        agent_id,
                        content_key,
                        mime_type,
                        original_name,
                        size as i64,
                        crate::agents::types::now_ms(),
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let platform_raw: String = row.get(2)?;
    let config_raw: String = row.get(3)?;
    let state_raw: String = row.get(9)?;

    Ok(AgentRecord {
        agent_id: row.get(0)?,
        display_name: row.get(1)?,
        platform: Platform::parse(&platform_raw).unwrap_or(Platform::TelegramBot),
        transport_config: serde_json::from_str(&config_raw)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        tenant: row.get(4)?,
        browser_session: row.get(5)?,
        swarm_enabled: row.get::<_, i64>(6)? != 0,
        reputation: ReputationCounters {
            successful_handoffs: row.get::<_, i64>(7)? as u64,
            contributed_learnings: row.get::<_, i64>(8)? as u64,
        },
        state: AgentState::parse(&state_raw).unwrap_or(AgentState::Created),
        created_at: row.get(10)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<UnifiedMessage> {
    let platform_raw: String = row.get(2)?;
    let direction_raw: String = row.get(3)?;
    let kind_raw: String = row.get(9)?;
    let meta_raw: String = row.get(13)?;

    Ok(UnifiedMessage {
        agent_id: row.get(0)?,
        id: row.get(1)?,
        platform: Platform::parse(&platform_raw).unwrap_or(Platform::TelegramBot),
        direction: if direction_raw == "outbound" {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        chat_id: row.get(4)?,
        sender_id: row.get(5)?,
        sender_name: row.get(6)?,
        body: row.get(7)?,
        timestamp: row.get(8)?,
        kind: MessageKind::parse(&kind_raw),
        has_media: row.get::<_, i64>(10)? != 0,
        from_me: row.get::<_, i64>(11)? != 0,
        reply_to: row.get(12)?,
        meta: serde_json::from_str(&meta_raw).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_flow(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRow> {
    let definition_raw: String = row.get(2)?;
    Ok(FlowRow {
        flow_id: row.get(0)?,
        agent_id: row.get(1)?,
        definition: serde_json::from_str(&definition_raw).unwrap_or(serde_json::Value::Null),
        active: row.get::<_, i64>(3)? != 0,
        updated_at: row.get(4)?,
    })
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    let trigger_raw: String = row.get(4)?;
    let variables_raw: String = row.get(5)?;
    Ok(ExecutionRow {
        execution_id: row.get(0)?,
        flow_id: row.get(1)?,
        agent_id: row.get(2)?,
        status: row.get(3)?,
        trigger_event: serde_json::from_str(&trigger_raw).unwrap_or(serde_json::Value::Null),
        variables: serde_json::from_str(&variables_raw).unwrap_or(serde_json::Value::Null),
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        error_kind: row.get(8)?,
        error_node: row.get(9)?,
        resumption_token: row.get(10)?,
        wake_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::types::now_ms;
    use tempfile::TempDir;

    async fn test_persistence() -> (Persistence, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = PersistenceConfig {
            database_path: dir.path().join("test.db").to_string_lossy().to_string(),
            max_connections: 3,
            retention_days: 30,
        };
        (Persistence::new(config).await.unwrap(), dir)
    }

    fn sample_message(id: &str, chat: &str, ts: i64) -> UnifiedMessage {
        UnifiedMessage {
            id: id.to_string(),
            agent_id: "agent-1".to_string(),
            platform: Platform::TelegramBot,
            direction: Direction::Inbound,
            chat_id: chat.to_string(),
            sender_id: "u1".to_string(),
            sender_name: "Alice".to_string(),
            body: "hello".to_string(),
            timestamp: ts,
            kind: MessageKind::Text,
            has_media: false,
            from_me: false,
            reply_to: None,
            meta: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn pool_returns_connection_after_error() {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePool::open(
            dir.path().join("pool.db").to_string_lossy().as_ref(),
            1,
        )
        .unwrap();

        let failed: Result<()> = pool.run(|_conn| anyhow::bail!("forced failure")).await;
        assert!(failed.is_err());

        // With a single connection, a second checkout only works if the
        // failed one made it back into the idle set.
        let ok = pool
            .run(|conn| {
                conn.execute_batch("CREATE TABLE t (x INTEGER)")?;
                Ok(())
            })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn duplicate_message_is_dropped() {
        let (p, _dir) = test_persistence().await;
        let msg = sample_message("tgb:1", "c1", now_ms());

        assert!(p.insert_message(&msg).await.unwrap());
        assert!(!p.insert_message(&msg).await.unwrap());

        let rows = p.get_messages("agent-1", Some("c1"), None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn per_chat_timestamps_never_regress() {
        let (p, _dir) = test_persistence().await;
        p.insert_message(&sample_message("tgb:1", "c1", 2000)).await.unwrap();
        p.insert_message(&sample_message("tgb:2", "c1", 1000)).await.unwrap();

        let rows = p.get_messages("agent-1", Some("c1"), None, 10).await.unwrap();
        let mut timestamps: Vec<i64> = rows.iter().map(|m| m.timestamp).collect();
        timestamps.sort();
        assert_eq!(timestamps, vec![2000, 2000]);
    }

    #[tokio::test]
    async fn cursor_pagination_walks_backwards() {
        let (p, _dir) = test_persistence().await;
        for i in 0..5 {
            p.insert_message(&sample_message(&format!("tgb:{}", i), "c1", 1000 + i))
                .await
                .unwrap();
        }

        let first = p.get_messages("agent-1", Some("c1"), None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, "tgb:4");

        let cursor = (first[1].timestamp, first[1].id.clone());
        let second = p
            .get_messages("agent-1", Some("c1"), Some(cursor), 2)
            .await
            .unwrap();
        assert_eq!(second[0].id, "tgb:2");
    }

    #[tokio::test]
    async fn tombstone_for_unknown_message_is_noop() {
        let (p, _dir) = test_persistence().await;
        let applied = p
            .append_tombstone("agent-1", "tgb:nope", "edit", Some("new"))
            .await
            .unwrap();
        assert!(!applied);

        p.insert_message(&sample_message("tgb:1", "c1", now_ms())).await.unwrap();
        let applied = p
            .append_tombstone("agent-1", "tgb:1", "edit", Some("new"))
            .await
            .unwrap();
        assert!(applied);
    }

    #[tokio::test]
    async fn agent_round_trip() {
        let (p, _dir) = test_persistence().await;
        let record = AgentRecord {
            agent_id: "agent-9".to_string(),
            display_name: "Demo".to_string(),
            platform: Platform::Whatsapp,
            transport_config: serde_json::json!({"gatewayUrl": "http://localhost:3000"}),
            tenant: "tenant-a".to_string(),
            browser_session: Some("sess-1".to_string()),
            swarm_enabled: true,
            reputation: ReputationCounters::default(),
            state: AgentState::Created,
            created_at: now_ms(),
        };
        p.upsert_agent(&record).await.unwrap();

        let loaded = p.get_agent("agent-9").await.unwrap().unwrap();
        assert_eq!(loaded.platform, Platform::Whatsapp);
        assert_eq!(loaded.tenant, "tenant-a");

        let listed = p.list_agents("tenant-a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(p.list_agents("tenant-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn suspension_round_trip() {
        let (p, _dir) = test_persistence().await;
        let row = ExecutionRow {
            execution_id: "exec-1".to_string(),
            flow_id: "flow-1".to_string(),
            agent_id: "agent-1".to_string(),
            status: "running".to_string(),
            trigger_event: serde_json::json!({}),
            variables: serde_json::json!({"x": 1}),
            started_at: now_ms(),
            finished_at: None,
            error_kind: None,
            error_node: None,
            resumption_token: None,
            wake_at: None,
        };
        p.insert_execution(&row).await.unwrap();
        p.suspend_execution("exec-1", "node-5", &serde_json::json!({"x": 2}), 123)
            .await
            .unwrap();

        let due = p.due_resumptions(200).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].resumption_token.as_deref(), Some("node-5"));
        assert_eq!(due[0].variables["x"], 2);

        p.finish_execution("exec-1", "succeeded", None, None).await.unwrap();
        assert!(p.due_resumptions(200).await.unwrap().is_empty());
    }
}
