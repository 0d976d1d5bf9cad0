//! SQLite-backed repositories. Rows keep the queried fields in columns and
//! the full entity as JSON in `data`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::error::{ColonyError, Result};
use colony_core::traits::{CandidateQuery, CronStore, GeneratorStore, GraphStore, ProcessStore};
use colony_core::types::{Cron, Generator, GeneratorArg, Process, ProcessState, WorkflowGraph};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

fn db_err(e: rusqlite::Error) -> ColonyError {
    ColonyError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(data: &str) -> Result<T> {
    Ok(serde_json::from_str(data)?)
}

const PROCESS_COLUMNS: &str = "id, colony_name, executor_type, executor_names, location_name, state, \
    assigned_executor_id, wait_for_parents, priority_time, cpu, memory, storage, nodes, processes, \
    processes_per_node, graph_id, version, data";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(db_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        tracing::info!("🗄️ SQLite store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ColonyError::Storage(format!("connection lock poisoned: {e}")))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS processes (
                id TEXT PRIMARY KEY,
                colony_name TEXT NOT NULL,
                executor_type TEXT NOT NULL,
                executor_names TEXT NOT NULL DEFAULT '[]',   -- JSON array
                location_name TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL,
                assigned_executor_id TEXT,
                wait_for_parents INTEGER NOT NULL DEFAULT 0,
                priority_time INTEGER NOT NULL,
                cpu INTEGER NOT NULL DEFAULT 0,
                memory INTEGER NOT NULL DEFAULT 0,
                storage INTEGER NOT NULL DEFAULT 0,
                nodes INTEGER NOT NULL DEFAULT 0,
                processes INTEGER NOT NULL DEFAULT 0,
                processes_per_node INTEGER NOT NULL DEFAULT 0,
                graph_id TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processes_candidates
                ON processes (colony_name, state, executor_type, wait_for_parents, priority_time);
            CREATE INDEX IF NOT EXISTS idx_processes_graph ON processes (graph_id);

            CREATE TABLE IF NOT EXISTS graphs (
                id TEXT PRIMARY KEY,
                colony_name TEXT NOT NULL,
                state TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS generators (
                id TEXT PRIMARY KEY,
                colony_name TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL,
                UNIQUE (colony_name, name)
            );

            CREATE TABLE IF NOT EXISTS generator_args (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                generator_id TEXT NOT NULL,
                colony_name TEXT NOT NULL,
                arg TEXT NOT NULL,
                added TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_generator_args ON generator_args (generator_id, seq);

            CREATE TABLE IF NOT EXISTS crons (
                id TEXT PRIMARY KEY,
                colony_name TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL,
                UNIQUE (colony_name, name)
            );
            ",
        )
        .map_err(db_err)
    }

    fn insert_process(conn: &Connection, p: &Process) -> Result<()> {
        let c = &p.spec.conditions;
        let sql = format!(
            "INSERT INTO processes ({PROCESS_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        );
        conn.execute(
            &sql,
            params![
                p.id,
                c.colony_name,
                c.executor_type,
                to_json(&c.executor_names)?,
                c.location_name,
                p.state.as_str(),
                p.assigned_executor_id,
                p.wait_for_parents,
                p.priority_time,
                c.resources.cpu,
                c.resources.memory,
                c.resources.storage,
                c.resources.nodes,
                c.resources.processes,
                c.resources.processes_per_node,
                p.graph_id,
                p.version as i64,
                to_json(p)?,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                ColonyError::Conflict(format!("process {} already exists", p.id))
            }
            other => db_err(other),
        })?;
        Ok(())
    }

    /// Rewrite the mutable columns of a process row if `version` still matches.
    fn write_process(conn: &Connection, p: &Process, expected: u64, extra_guard: &str) -> Result<usize> {
        let sql = format!(
            "UPDATE processes SET state = ?1, assigned_executor_id = ?2, wait_for_parents = ?3, \
             priority_time = ?4, version = ?5, data = ?6 WHERE id = ?7 AND version = ?8 {extra_guard}"
        );
        conn.execute(
            &sql,
            params![
                p.state.as_str(),
                p.assigned_executor_id,
                p.wait_for_parents,
                p.priority_time,
                p.version as i64,
                to_json(p)?,
                p.id,
                expected as i64,
            ],
        )
        .map_err(db_err)
    }

    fn load_process(conn: &Connection, id: &str) -> Result<Option<Process>> {
        let data: Option<String> = conn
            .query_row("SELECT data FROM processes WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        data.map(|d| from_json(&d)).transpose()
    }

    fn query_processes(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Process>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |r| r.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_json(&row.map_err(db_err)?)?);
        }
        Ok(out)
    }

    fn candidates(&self, query: &CandidateQuery, named: bool) -> Result<Vec<Process>> {
        let conn = self.lock()?;
        let name_rule = if named {
            "EXISTS (SELECT 1 FROM json_each(executor_names) WHERE value = ?10)"
        } else {
            "executor_names = '[]' AND ?10 = ?10"
        };
        let sql = format!(
            "SELECT data FROM processes
             WHERE state = 'WAITING' AND assigned_executor_id IS NULL AND wait_for_parents = 0
               AND colony_name = ?1 AND executor_type = ?2
               AND (location_name = '' OR lower(location_name) = lower(?3))
               AND cpu <= ?4 AND memory <= ?5 AND storage <= ?6
               AND nodes <= ?7 AND processes <= ?8 AND processes_per_node <= ?9
               AND {name_rule}
             ORDER BY priority_time, rowid
             LIMIT ?11"
        );
        let r = &query.resources;
        let limit = query.limit as i64;
        Self::query_processes(
            &conn,
            &sql,
            params![
                query.colony_name,
                query.executor_type,
                query.location_name,
                r.cpu,
                r.memory,
                r.storage,
                r.nodes,
                r.processes,
                r.processes_per_node,
                query.executor_name,
                limit,
            ],
        )
    }

    fn load_versioned<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        table: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let sql = format!("SELECT data FROM {table} WHERE id = ?1");
        let data: Option<String> = conn
            .query_row(&sql, params![id], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        data.map(|d| from_json(&d)).transpose()
    }

    fn list_versioned<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |r| r.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_json(&row.map_err(db_err)?)?);
        }
        Ok(out)
    }

    /// Compare-and-swap for the tables that only index by id.
    fn swap_versioned(
        conn: &Connection,
        table: &str,
        id: &str,
        data: &str,
        extra_set: &str,
        extra_value: &str,
        expected: u64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET data = ?1, version = ?2{extra_set} WHERE id = ?4 AND version = ?5"
        );
        let changed = conn
            .execute(
                &sql,
                params![data, (expected + 1) as i64, extra_value, id, expected as i64],
            )
            .map_err(db_err)?;
        if changed == 1 {
            return Ok(());
        }
        let exists: bool = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table} WHERE id = ?1"), params![id], |r| {
                r.get::<_, i64>(0)
            })
            .map(|n| n > 0)
            .map_err(db_err)?;
        if exists {
            Err(ColonyError::Conflict(format!("{id} changed concurrently")))
        } else {
            Err(ColonyError::NotFound(id.to_string()))
        }
    }

    fn insert_named(conn: &Connection, table: &str, id: &str, colony: &str, name: &str, data: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} (id, colony_name, name, version, data) VALUES (?1, ?2, ?3, 0, ?4)"
        );
        conn.execute(&sql, params![id, colony, name, data])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                    ColonyError::Conflict(format!("'{name}' already exists in colony '{colony}'"))
                }
                other => db_err(other),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ProcessStore for SqliteStore {
    async fn add_process(&self, process: &Process) -> Result<()> {
        let conn = self.lock()?;
        Self::insert_process(&conn, process)
    }

    async fn get_process(&self, id: &str) -> Result<Option<Process>> {
        let conn = self.lock()?;
        Self::load_process(&conn, id)
    }

    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Process>> {
        self.candidates(query, false)
    }

    async fn find_candidates_by_name(&self, query: &CandidateQuery) -> Result<Vec<Process>> {
        self.candidates(query, true)
    }

    async fn find_processes_by_graph(&self, graph_id: &str) -> Result<Vec<Process>> {
        let conn = self.lock()?;
        Self::query_processes(
            &conn,
            "SELECT data FROM processes WHERE graph_id = ?1 ORDER BY rowid",
            params![graph_id],
        )
    }

    async fn claim_process(&self, id: &str, executor_id: &str, at: DateTime<Utc>) -> Result<Process> {
        let conn = self.lock()?;
        let mut process = Self::load_process(&conn, id)?
            .ok_or_else(|| ColonyError::NotFound(format!("process {id}")))?;
        if !process.is_claimable() {
            return Err(ColonyError::Conflict(format!("process {id} is no longer claimable")));
        }
        let expected = process.version;
        process.apply_claim(executor_id, at);
        process.version = expected + 1;

        // The row guard repeats the claimability check so a writer on
        // another connection cannot slip in between the read and the write.
        let changed = Self::write_process(
            &conn,
            &process,
            expected,
            "AND state = 'WAITING' AND assigned_executor_id IS NULL AND wait_for_parents = 0",
        )?;
        if changed == 0 {
            return Err(ColonyError::Conflict(format!("process {id} was claimed concurrently")));
        }
        Ok(process)
    }

    async fn update_process(&self, process: &Process, expected_version: u64) -> Result<Process> {
        let conn = self.lock()?;
        let mut stored = process.clone();
        stored.version = expected_version + 1;
        let changed = Self::write_process(&conn, &stored, expected_version, "")?;
        if changed == 1 {
            return Ok(stored);
        }
        match Self::load_process(&conn, &process.id)? {
            Some(_) => Err(ColonyError::Conflict(format!("process {} changed concurrently", process.id))),
            None => Err(ColonyError::NotFound(format!("process {}", process.id))),
        }
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn add_graph(&self, graph: &WorkflowGraph, processes: &[Process]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO graphs (id, colony_name, state, version, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                graph.id,
                graph.colony_name,
                graph.state.as_str(),
                graph.version as i64,
                to_json(graph)?
            ],
        )
        .map_err(db_err)?;
        for p in processes {
            Self::insert_process(&tx, p)?;
        }
        tx.commit().map_err(db_err)
    }

    async fn get_graph(&self, id: &str) -> Result<Option<WorkflowGraph>> {
        let conn = self.lock()?;
        Self::load_versioned(&conn, "graphs", id)
    }

    async fn list_graphs(&self, colony_name: &str) -> Result<Vec<WorkflowGraph>> {
        let conn = self.lock()?;
        Self::list_versioned(
            &conn,
            "SELECT data FROM graphs WHERE colony_name = ?1 ORDER BY rowid",
            params![colony_name],
        )
    }

    async fn list_active_graphs(&self) -> Result<Vec<WorkflowGraph>> {
        let conn = self.lock()?;
        Self::list_versioned(
            &conn,
            "SELECT data FROM graphs WHERE state IN ('WAITING', 'RUNNING') ORDER BY rowid",
            params![],
        )
    }

    async fn update_graph(&self, graph: &WorkflowGraph, expected_version: u64) -> Result<WorkflowGraph> {
        let conn = self.lock()?;
        let mut stored = graph.clone();
        stored.version = expected_version + 1;
        Self::swap_versioned(
            &conn,
            "graphs",
            &graph.id,
            &to_json(&stored)?,
            ", state = ?3",
            graph.state.as_str(),
            expected_version,
        )?;
        Ok(stored)
    }
}

#[async_trait]
impl GeneratorStore for SqliteStore {
    async fn add_generator(&self, generator: &Generator) -> Result<()> {
        let conn = self.lock()?;
        Self::insert_named(
            &conn,
            "generators",
            &generator.id,
            &generator.colony_name,
            &generator.name,
            &to_json(generator)?,
        )
    }

    async fn get_generator(&self, id: &str) -> Result<Option<Generator>> {
        let conn = self.lock()?;
        Self::load_versioned(&conn, "generators", id)
    }

    async fn find_generator_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Generator>> {
        let conn = self.lock()?;
        let found: Vec<Generator> = Self::list_versioned(
            &conn,
            "SELECT data FROM generators WHERE colony_name = ?1 AND name = ?2",
            params![colony_name, name],
        )?;
        Ok(found.into_iter().next())
    }

    async fn list_generators(&self) -> Result<Vec<Generator>> {
        let conn = self.lock()?;
        Self::list_versioned(&conn, "SELECT data FROM generators ORDER BY rowid", params![])
    }

    async fn remove_generator(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM generator_args WHERE generator_id = ?1", params![id])
            .map_err(db_err)?;
        let removed = tx
            .execute("DELETE FROM generators WHERE id = ?1", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(removed > 0)
    }

    async fn update_generator(&self, generator: &Generator, expected_version: u64) -> Result<Generator> {
        let conn = self.lock()?;
        let mut stored = generator.clone();
        stored.version = expected_version + 1;
        Self::swap_versioned(
            &conn,
            "generators",
            &generator.id,
            &to_json(&stored)?,
            ", name = ?3",
            &generator.name,
            expected_version,
        )?;
        Ok(stored)
    }

    async fn add_generator_arg(&self, arg: &GeneratorArg) -> Result<GeneratorArg> {
        let conn = self.lock()?;
        let known: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM generators WHERE id = ?1",
                params![arg.generator_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if known == 0 {
            return Err(ColonyError::NotFound(format!("generator {}", arg.generator_id)));
        }
        conn.execute(
            "INSERT INTO generator_args (id, generator_id, colony_name, arg, added) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![arg.id, arg.generator_id, arg.colony_name, arg.arg, arg.added.to_rfc3339()],
        )
        .map_err(db_err)?;
        let mut stored = arg.clone();
        stored.seq = conn.last_insert_rowid();
        Ok(stored)
    }

    async fn count_generator_args(&self, generator_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM generator_args WHERE generator_id = ?1",
                params![generator_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        Ok(n.max(0) as usize)
    }

    async fn take_generator_args(&self, generator_id: &str, n: usize) -> Result<Vec<GeneratorArg>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let taken = {
            let mut stmt = tx
                .prepare(
                    "SELECT seq, id, generator_id, colony_name, arg, added FROM generator_args
                     WHERE generator_id = ?1 ORDER BY seq LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![generator_id, n as i64], |r| {
                    let added: String = r.get(5)?;
                    Ok(GeneratorArg {
                        seq: r.get(0)?,
                        id: r.get(1)?,
                        generator_id: r.get(2)?,
                        colony_name: r.get(3)?,
                        arg: r.get(4)?,
                        added: DateTime::parse_from_rfc3339(&added)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })
                .map_err(db_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)?
        };
        for arg in &taken {
            tx.execute("DELETE FROM generator_args WHERE seq = ?1", params![arg.seq])
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(taken)
    }

    async fn restore_generator_args(&self, args: &[GeneratorArg]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        for arg in args {
            tx.execute(
                "INSERT INTO generator_args (seq, id, generator_id, colony_name, arg, added)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6 WHERE EXISTS (SELECT 1 FROM generators WHERE id = ?3)",
                params![
                    arg.seq,
                    arg.id,
                    arg.generator_id,
                    arg.colony_name,
                    arg.arg,
                    arg.added.to_rfc3339()
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }
}

#[async_trait]
impl CronStore for SqliteStore {
    async fn add_cron(&self, cron: &Cron) -> Result<()> {
        let conn = self.lock()?;
        Self::insert_named(&conn, "crons", &cron.id, &cron.colony_name, &cron.name, &to_json(cron)?)
    }

    async fn get_cron(&self, id: &str) -> Result<Option<Cron>> {
        let conn = self.lock()?;
        Self::load_versioned(&conn, "crons", id)
    }

    async fn find_cron_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Cron>> {
        let conn = self.lock()?;
        let found: Vec<Cron> = Self::list_versioned(
            &conn,
            "SELECT data FROM crons WHERE colony_name = ?1 AND name = ?2",
            params![colony_name, name],
        )?;
        Ok(found.into_iter().next())
    }

    async fn list_crons(&self) -> Result<Vec<Cron>> {
        let conn = self.lock()?;
        Self::list_versioned(&conn, "SELECT data FROM crons ORDER BY rowid", params![])
    }

    async fn remove_cron(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM crons WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    async fn update_cron(&self, cron: &Cron, expected_version: u64) -> Result<Cron> {
        let conn = self.lock()?;
        let mut stored = cron.clone();
        stored.version = expected_version + 1;
        Self::swap_versioned(
            &conn,
            "crons",
            &cron.id,
            &to_json(&stored)?,
            ", name = ?3",
            &cron.name,
            expected_version,
        )?;
        Ok(stored)
    }
}

/// Count processes per state, used by the daemon's status line.
pub fn state_counts(store: &SqliteStore) -> Result<Vec<(ProcessState, i64)>> {
    let conn = store.lock()?;
    let mut stmt = conn
        .prepare("SELECT state, COUNT(*) FROM processes GROUP BY state")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        let (state, n) = row.map_err(db_err)?;
        if let Some(state) = ProcessState::parse(&state) {
            out.push((state, n));
        }
    }
    Ok(out)
}
