use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Params, Row,
    TransactionBehavior,
};
use scroll_vault_core::{
    compute_cycle_hash, CycleDraft, CycleFilter, CycleId, CycleLedger, CyclePatch, CycleStats,
    CycleTx, FilterValue, IngestEvent, MemoryCycle, ProvenanceDraft, ProvenanceEntry,
    RangePredicate, StateDocument, StoreFault, UniqueKey, WindowAggregate,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod archive;

pub use archive::{archive_file_name, read_archive, write_archive, ArchiveExport};

const CREATE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS memory_cycles (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  signifier TEXT NOT NULL UNIQUE,
  t INTEGER NOT NULL,
  self_state_json TEXT NOT NULL,
  echo_state_json TEXT NOT NULL,
  glyphstream_json TEXT NOT NULL,
  ache REAL NOT NULL,
  drift REAL NOT NULL,
  entropy REAL NOT NULL,
  xi INTEGER NOT NULL CHECK (xi IN (0, 1)),
  cycle_hash TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS provenance_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  memory_id INTEGER NOT NULL REFERENCES memory_cycles(id) ON DELETE CASCADE,
  source_address TEXT NOT NULL,
  node_id TEXT,
  cycle_hash TEXT NOT NULL,
  signifier TEXT NOT NULL,
  event TEXT NOT NULL CHECK (event IN ('ingest', 'duplicate_ingest')),
  received_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_cycles_t ON memory_cycles(t);
CREATE INDEX IF NOT EXISTS idx_provenance_logs_memory_id ON provenance_logs(memory_id);
";

const CYCLE_COLUMNS: &str = "id, signifier, t, self_state_json, echo_state_json, \
     glyphstream_json, ache, drift, entropy, xi, cycle_hash, created_at, updated_at";

const PROVENANCE_COLUMNS: &str =
    "id, memory_id, source_address, node_id, cycle_hash, signifier, event, received_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub cycle_count: u64,
    pub provenance_count: u64,
}

impl SqliteStore {
    /// Open a SQLite-backed vault and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Create tables and indexes when they are missing. Safe to call on every open.
    ///
    /// # Errors
    /// Returns an error when the schema statements fail.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL).context("failed to create vault schema")
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored row is malformed.
    pub fn find_by_hash(&self, cycle_hash: &str) -> Result<Option<MemoryCycle>> {
        select_cycle(&self.conn, UniqueKey::CycleHash, cycle_hash)
            .with_context(|| format!("failed to load cycle by hash {cycle_hash}"))
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored row is malformed.
    pub fn find_by_signifier(&self, signifier: &str) -> Result<Option<MemoryCycle>> {
        select_cycle(&self.conn, UniqueKey::Signifier, signifier)
            .with_context(|| format!("failed to load cycle by signifier {signifier}"))
    }

    /// The cycle with the highest `t`; ties go to the most recently inserted.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn latest_cycle(&self) -> Result<Option<MemoryCycle>> {
        let sql =
            format!("SELECT {CYCLE_COLUMNS} FROM memory_cycles ORDER BY t DESC, id DESC LIMIT 1");
        let cycles = select_cycles(&self.conn, &sql, []).context("failed to load latest cycle")?;
        Ok(cycles.into_iter().next())
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_cycles(&self, limit: u32) -> Result<Vec<MemoryCycle>> {
        let sql =
            format!("SELECT {CYCLE_COLUMNS} FROM memory_cycles ORDER BY t DESC, id DESC LIMIT ?1");
        select_cycles(&self.conn, &sql, params![limit]).context("failed to list memory cycles")
    }

    /// Every stored cycle in ascending `t`, then insertion, order.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_cycles_ascending(&self) -> Result<Vec<MemoryCycle>> {
        let sql = format!("SELECT {CYCLE_COLUMNS} FROM memory_cycles ORDER BY t ASC, id ASC");
        select_cycles(&self.conn, &sql, []).context("failed to list memory cycles for archive")
    }

    /// Insert one cycle, rejecting a hash or signifier that is already stored.
    ///
    /// # Errors
    /// Returns an error wrapping [`StoreFault::Unique`] on a duplicate, or any store failure.
    pub fn create_cycle(&mut self, draft: &CycleDraft) -> Result<MemoryCycle> {
        let mut created = self.create_cycles(std::slice::from_ref(draft))?;
        created.pop().context("insert returned no cycle")
    }

    /// Insert every draft in one transaction; any failure leaves the store unchanged.
    ///
    /// # Errors
    /// Returns an error wrapping [`StoreFault::Unique`] when any draft collides with a
    /// stored cycle or with an earlier draft in the same batch.
    pub fn create_cycles(&mut self, drafts: &[CycleDraft]) -> Result<Vec<MemoryCycle>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start create transaction")?;

        let mut created = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let cycle_hash = compute_cycle_hash(draft);
            let cycle = insert_cycle_row(&tx, draft, &cycle_hash)
                .with_context(|| format!("failed to insert cycle {}", draft.signifier))?;
            created.push(cycle);
        }

        tx.commit().context("failed to commit create transaction")?;
        Ok(created)
    }

    /// Replace `echo_state` and `xi` of the cycle named `signifier`.
    ///
    /// `cycle_hash` is left untouched. Returns `None` when no cycle has that signifier.
    ///
    /// # Errors
    /// Returns an error when the update or the reload fails.
    pub fn patch_cycle(
        &mut self,
        signifier: &str,
        patch: &CyclePatch,
    ) -> Result<Option<MemoryCycle>> {
        let echo_state_json = encode_json(&patch.echo_state, "echo_state")?;
        let now = rfc3339(OffsetDateTime::now_utc())?;

        let tx = self.conn.transaction().context("failed to start patch transaction")?;
        let changed = tx
            .execute(
                "UPDATE memory_cycles
                 SET echo_state_json = ?1, xi = ?2, updated_at = ?3
                 WHERE signifier = ?4",
                params![echo_state_json, patch.xi, now, signifier],
            )
            .with_context(|| format!("failed to patch cycle {signifier}"))?;

        let patched = if changed == 0 {
            None
        } else {
            select_cycle(&tx, UniqueKey::Signifier, signifier)
                .with_context(|| format!("failed to reload patched cycle {signifier}"))?
        };
        tx.commit().context("failed to commit patch transaction")?;
        Ok(patched)
    }

    /// Count and metric means across every cycle. An empty vault reports zeros.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn stats(&self) -> Result<CycleStats> {
        let (count, mean_ache, mean_drift, mean_entropy, latest_t) = self
            .conn
            .query_row(
                "SELECT COUNT(*), AVG(ache), AVG(drift), AVG(entropy), MAX(t) FROM memory_cycles",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .context("failed to compute cycle stats")?;

        Ok(CycleStats {
            total_cycles: u64::try_from(count).context("negative cycle count")?,
            mean_ache: mean_ache.unwrap_or(0.0),
            mean_drift: mean_drift.unwrap_or(0.0),
            mean_entropy: mean_entropy.unwrap_or(0.0),
            latest_t: latest_t.unwrap_or(0),
        })
    }

    /// Cycles satisfying every bound in `filter`, highest `t` first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn query_cycles(&self, filter: &CycleFilter, limit: u32) -> Result<Vec<MemoryCycle>> {
        let (clause, mut values) = filter_clause(&filter.predicates());
        values.push(SqlValue::Integer(i64::from(limit)));
        let sql = format!(
            "SELECT {CYCLE_COLUMNS} FROM memory_cycles{clause} ORDER BY t DESC, id DESC LIMIT ?{}",
            values.len()
        );
        select_cycles(&self.conn, &sql, params_from_iter(values))
            .context("failed to run filtered cycle query")
    }

    /// Group cycles into buckets of `window` consecutive `t` values.
    ///
    /// Bucket index is `floor(t / window)`, so negative `t` lands in negative buckets.
    /// Buckets come back highest index first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn aggregate_windows(&self, window: i64, limit: u32) -> Result<Vec<WindowAggregate>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT CASE WHEN t >= 0 THEN t / ?1 ELSE -((-(t + 1)) / ?1) - 1 END
                            AS window_index,
                        AVG(ache), AVG(drift), AVG(entropy), COUNT(*)
                 FROM memory_cycles
                 GROUP BY window_index
                 ORDER BY window_index DESC
                 LIMIT ?2",
            )
            .context("failed to prepare window aggregate query")?;
        let rows = stmt
            .query_map(params![window, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("failed to run window aggregate query")?;

        let mut windows = Vec::new();
        for row in rows {
            let (window_index, avg_ache, avg_drift, avg_entropy, count) =
                row.context("failed to decode window aggregate row")?;
            windows.push(WindowAggregate {
                window_index,
                avg_ache,
                avg_drift,
                avg_entropy,
                count: u64::try_from(count).context("negative window count")?,
            });
        }
        Ok(windows)
    }

    /// Case-insensitive substring match on the signifier or any glyph.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn search_cycles(&self, keyword: &str, limit: u32) -> Result<Vec<MemoryCycle>> {
        let sql = format!(
            r"SELECT {CYCLE_COLUMNS} FROM memory_cycles
              WHERE signifier LIKE ?1 ESCAPE '\' OR glyphstream_json LIKE ?1 ESCAPE '\'
              ORDER BY t DESC, id DESC
              LIMIT ?2"
        );
        select_cycles(&self.conn, &sql, params![like_pattern(keyword), limit])
            .with_context(|| format!("failed to search cycles for {keyword:?}"))
    }

    /// Most recent provenance entries first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_provenance(&self, limit: u32) -> Result<Vec<ProvenanceEntry>> {
        let sql =
            format!("SELECT {PROVENANCE_COLUMNS} FROM provenance_logs ORDER BY id DESC LIMIT ?1");
        select_provenance(&self.conn, &sql, params![limit])
            .context("failed to list provenance entries")
    }

    /// Provenance entries for one cycle, oldest first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn provenance_for_cycle(&self, memory_id: CycleId) -> Result<Vec<ProvenanceEntry>> {
        let sql = format!(
            "SELECT {PROVENANCE_COLUMNS} FROM provenance_logs WHERE memory_id = ?1 ORDER BY id ASC"
        );
        select_provenance(&self.conn, &sql, params![memory_id.0])
            .with_context(|| format!("failed to load provenance for cycle {memory_id}"))
    }

    /// Run quick-check and foreign-key-check and count stored rows.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            cycle_count: self.count_rows("memory_cycles")?,
            provenance_count: self.count_rows("provenance_logs")?,
        })
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .with_context(|| format!("failed to count rows in {table}"))?;
        u64::try_from(count).with_context(|| format!("negative row count in {table}"))
    }
}

impl CycleLedger for SqliteStore {
    fn transact<T, F>(&mut self, work: F) -> std::result::Result<T, StoreFault>
    where
        F: FnOnce(&dyn CycleTx) -> std::result::Result<T, StoreFault>,
    {
        // IMMEDIATE takes the write lock up front so the duplicate pre-check and the
        // insert see the same snapshot.
        let tx =
            self.conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(fault)?;
        let value = work(&SqliteTx { conn: &tx })?;
        tx.commit().map_err(fault)?;
        Ok(value)
    }
}

struct SqliteTx<'conn> {
    conn: &'conn Connection,
}

impl CycleTx for SqliteTx<'_> {
    fn find_by_hash(
        &self,
        cycle_hash: &str,
    ) -> std::result::Result<Option<MemoryCycle>, StoreFault> {
        select_cycle(self.conn, UniqueKey::CycleHash, cycle_hash)
    }

    fn find_by_signifier(
        &self,
        signifier: &str,
    ) -> std::result::Result<Option<MemoryCycle>, StoreFault> {
        select_cycle(self.conn, UniqueKey::Signifier, signifier)
    }

    fn insert_cycle(
        &self,
        draft: &CycleDraft,
        cycle_hash: &str,
    ) -> std::result::Result<MemoryCycle, StoreFault> {
        insert_cycle_row(self.conn, draft, cycle_hash)
    }

    fn append_provenance(
        &self,
        entry: &ProvenanceDraft,
    ) -> std::result::Result<ProvenanceEntry, StoreFault> {
        insert_provenance_row(self.conn, entry)
    }
}

/// Translate range predicates into a `WHERE` clause with numbered placeholders.
///
/// Returns an empty clause and no values when there are no predicates.
#[must_use]
pub fn filter_clause(predicates: &[RangePredicate]) -> (String, Vec<SqlValue>) {
    let mut conditions = Vec::with_capacity(predicates.len());
    let mut values = Vec::with_capacity(predicates.len());

    for (index, predicate) in predicates.iter().enumerate() {
        conditions.push(format!(
            "{} {} ?{}",
            predicate.column.as_str(),
            predicate.bound.operator(),
            index + 1
        ));
        values.push(match predicate.value {
            FilterValue::Integer(value) => SqlValue::Integer(value),
            FilterValue::Float(value) => SqlValue::Real(value),
        });
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

/// Wrap `keyword` for a `LIKE ... ESCAPE '\'` substring match.
fn like_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 2);
    pattern.push('%');
    for ch in keyword.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn select_cycle(
    conn: &Connection,
    key: UniqueKey,
    value: &str,
) -> std::result::Result<Option<MemoryCycle>, StoreFault> {
    let sql = format!("SELECT {CYCLE_COLUMNS} FROM memory_cycles WHERE {} = ?1", key.as_str());
    let row = conn.query_row(&sql, params![value], CycleRow::from_row).optional().map_err(fault)?;
    row.map(CycleRow::into_cycle).transpose()
}

fn select_cycles<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> std::result::Result<Vec<MemoryCycle>, StoreFault> {
    let mut stmt = conn.prepare(sql).map_err(fault)?;
    let rows = stmt.query_map(params, CycleRow::from_row).map_err(fault)?;

    let mut cycles = Vec::new();
    for row in rows {
        cycles.push(row.map_err(fault)?.into_cycle()?);
    }
    Ok(cycles)
}

fn select_provenance<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> std::result::Result<Vec<ProvenanceEntry>, StoreFault> {
    let mut stmt = conn.prepare(sql).map_err(fault)?;
    let rows = stmt.query_map(params, ProvenanceRow::from_row).map_err(fault)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.map_err(fault)?.into_entry()?);
    }
    Ok(entries)
}

fn insert_cycle_row(
    conn: &Connection,
    draft: &CycleDraft,
    cycle_hash: &str,
) -> std::result::Result<MemoryCycle, StoreFault> {
    let now = OffsetDateTime::now_utc();
    let stamp = rfc3339(now)?;

    conn.execute(
        "INSERT INTO memory_cycles(
            signifier, t, self_state_json, echo_state_json, glyphstream_json,
            ache, drift, entropy, xi, cycle_hash, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            draft.signifier,
            draft.t,
            encode_json(&draft.self_state, "self_state")?,
            encode_json(&draft.echo_state, "echo_state")?,
            encode_json(&draft.glyphstream, "glyphstream")?,
            draft.ache,
            draft.drift,
            draft.entropy,
            draft.xi,
            cycle_hash,
            stamp,
            stamp,
        ],
    )
    .map_err(fault)?;

    Ok(MemoryCycle {
        id: CycleId(conn.last_insert_rowid()),
        signifier: draft.signifier.clone(),
        t: draft.t,
        self_state: draft.self_state.clone(),
        echo_state: draft.echo_state.clone(),
        glyphstream: draft.glyphstream.clone(),
        ache: draft.ache,
        drift: draft.drift,
        entropy: draft.entropy,
        xi: draft.xi,
        cycle_hash: cycle_hash.to_string(),
        created_at: now,
        updated_at: now,
    })
}

fn insert_provenance_row(
    conn: &Connection,
    entry: &ProvenanceDraft,
) -> std::result::Result<ProvenanceEntry, StoreFault> {
    let now = OffsetDateTime::now_utc();

    conn.execute(
        "INSERT INTO provenance_logs(
            memory_id, source_address, node_id, cycle_hash, signifier, event, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.memory_id.0,
            entry.source_address,
            entry.node_id,
            entry.cycle_hash,
            entry.signifier,
            entry.event.as_str(),
            rfc3339(now)?,
        ],
    )
    .map_err(fault)?;

    Ok(ProvenanceEntry {
        id: conn.last_insert_rowid(),
        memory_id: entry.memory_id,
        source_address: entry.source_address.clone(),
        node_id: entry.node_id.clone(),
        cycle_hash: entry.cycle_hash.clone(),
        signifier: entry.signifier.clone(),
        event: entry.event,
        received_at: now,
    })
}

/// Classify a driver error into the vault's store fault taxonomy.
fn fault(err: rusqlite::Error) -> StoreFault {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.code == ErrorCode::ConstraintViolation && message.starts_with("UNIQUE") {
            let key = if message.contains("signifier") {
                UniqueKey::Signifier
            } else {
                UniqueKey::CycleHash
            };
            return StoreFault::Unique(key);
        }
    }
    StoreFault::Unavailable(err.to_string())
}

struct CycleRow {
    id: i64,
    signifier: String,
    t: i64,
    self_state_json: String,
    echo_state_json: String,
    glyphstream_json: String,
    ache: f64,
    drift: f64,
    entropy: f64,
    xi: bool,
    cycle_hash: String,
    created_at: String,
    updated_at: String,
}

impl CycleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            signifier: row.get(1)?,
            t: row.get(2)?,
            self_state_json: row.get(3)?,
            echo_state_json: row.get(4)?,
            glyphstream_json: row.get(5)?,
            ache: row.get(6)?,
            drift: row.get(7)?,
            entropy: row.get(8)?,
            xi: row.get(9)?,
            cycle_hash: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_cycle(self) -> std::result::Result<MemoryCycle, StoreFault> {
        Ok(MemoryCycle {
            id: CycleId(self.id),
            self_state: decode_json::<StateDocument>(&self.self_state_json, "self_state")?,
            echo_state: decode_json::<StateDocument>(&self.echo_state_json, "echo_state")?,
            glyphstream: decode_json::<Vec<String>>(&self.glyphstream_json, "glyphstream")?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
            signifier: self.signifier,
            t: self.t,
            ache: self.ache,
            drift: self.drift,
            entropy: self.entropy,
            xi: self.xi,
            cycle_hash: self.cycle_hash,
        })
    }
}

struct ProvenanceRow {
    id: i64,
    memory_id: i64,
    source_address: String,
    node_id: Option<String>,
    cycle_hash: String,
    signifier: String,
    event: String,
    received_at: String,
}

impl ProvenanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            memory_id: row.get(1)?,
            source_address: row.get(2)?,
            node_id: row.get(3)?,
            cycle_hash: row.get(4)?,
            signifier: row.get(5)?,
            event: row.get(6)?,
            received_at: row.get(7)?,
        })
    }

    fn into_entry(self) -> std::result::Result<ProvenanceEntry, StoreFault> {
        let Some(event) = IngestEvent::parse(&self.event) else {
            return Err(StoreFault::Corrupt(format!("unknown provenance event {}", self.event)));
        };
        Ok(ProvenanceEntry {
            id: self.id,
            memory_id: CycleId(self.memory_id),
            source_address: self.source_address,
            node_id: self.node_id,
            cycle_hash: self.cycle_hash,
            signifier: self.signifier,
            event,
            received_at: parse_rfc3339(&self.received_at)?,
        })
    }
}

fn encode_json<T: Serialize>(value: &T, field: &str) -> std::result::Result<String, StoreFault> {
    serde_json::to_string(value)
        .map_err(|err| StoreFault::Corrupt(format!("failed to encode {field}: {err}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    field: &str,
) -> std::result::Result<T, StoreFault> {
    serde_json::from_str(raw)
        .map_err(|err| StoreFault::Corrupt(format!("invalid {field} column: {err}")))
}

fn rfc3339(value: OffsetDateTime) -> std::result::Result<String, StoreFault> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreFault::Corrupt(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> std::result::Result<OffsetDateTime, StoreFault> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreFault::Corrupt(format!("invalid RFC3339 timestamp {value}: {err}")))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    use anyhow::anyhow;
    use scroll_vault_core::{
        ingest, Bound, FilterColumn, IngestOrigin, StateDocument, VaultError,
    };
    use serde_json::{json, Value};
    use ulid::Ulid;

    use super::*;

    fn object(value: Value) -> StateDocument {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be a JSON object, got {other}"),
        }
    }

    fn mk_draft(signifier: &str, t: i64, ache: f64) -> CycleDraft {
        CycleDraft {
            t,
            signifier: signifier.to_string(),
            self_state: object(json!({"mood": "still"})),
            echo_state: StateDocument::new(),
            glyphstream: vec![format!("{signifier}-glyph")],
            ache,
            drift: 0.1,
            entropy: 0.05,
            xi: false,
        }
    }

    fn open_memory_store() -> Result<SqliteStore> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.ensure_schema()?;
        Ok(store)
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("scroll-vault-store-{}.sqlite3", Ulid::new()))
    }

    fn remove_db_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn store_fault(err: &anyhow::Error) -> Option<&StoreFault> {
        err.chain().find_map(|cause| cause.downcast_ref::<StoreFault>())
    }

    #[test]
    fn open_waits_out_a_held_lock_on_a_fresh_file() -> Result<()> {
        let db_path = unique_temp_db_path();
        let holder = rusqlite::Connection::open(&db_path)?;
        holder.execute_batch("CREATE TABLE warmup (x INTEGER); BEGIN EXCLUSIVE;")?;
        let release = std::thread::spawn(move || -> rusqlite::Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            holder.execute_batch("COMMIT;")
        });

        let store = SqliteStore::open(&db_path)?;
        let mode: String = store.conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        assert_eq!(mode, "wal");
        let timeout: i64 = store.conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
        assert_eq!(timeout, 5000);

        match release.join() {
            Ok(result) => result?,
            Err(_) => panic!("lock holder thread panicked"),
        }
        drop(store);
        remove_db_files(&db_path)
    }

    // Test IDs: TDB-001
    #[test]
    fn schema_enforces_uniqueness_checks_and_foreign_keys() -> Result<()> {
        let mut store = open_memory_store()?;
        store.create_cycle(&mk_draft("alpha", 1, 0.2))?;

        let insert = |signifier: &str, xi: i64, cycle_hash: &str| {
            store.conn.execute(
                "INSERT INTO memory_cycles(
                    signifier, t, self_state_json, echo_state_json, glyphstream_json,
                    ache, drift, entropy, xi, cycle_hash, created_at, updated_at
                ) VALUES (?1, 1, '{}', '{}', '[]', 0.0, 0.0, 0.0, ?2, ?3,
                          '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                params![signifier, xi, cycle_hash],
            )
        };
        assert!(insert("alpha", 0, "fresh-hash").is_err());
        assert!(insert("beta", 2, "another-hash").is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO provenance_logs(
                memory_id, source_address, node_id, cycle_hash, signifier, event, received_at
            ) VALUES (999, '10.0.0.1', NULL, 'h', 's', 'ingest', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(fk_result.is_err());

        let event_result = store.conn.execute(
            "INSERT INTO provenance_logs(
                memory_id, source_address, node_id, cycle_hash, signifier, event, received_at
            ) VALUES (1, '10.0.0.1', NULL, 'h', 's', 'deleted', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(event_result.is_err());

        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn ensure_schema_is_idempotent() -> Result<()> {
        let mut store = open_memory_store()?;
        store.create_cycle(&mk_draft("alpha", 1, 0.2))?;
        store.ensure_schema()?;
        assert_eq!(store.list_cycles(10)?.len(), 1);
        Ok(())
    }

    // Test IDs: TING-001
    #[test]
    fn repeated_ingest_stores_once_and_logs_both_events() -> Result<()> {
        let mut store = open_memory_store()?;
        let draft = mk_draft("alpha", 1, 0.2);

        let first = ingest(&mut store, &draft, &IngestOrigin::new("10.0.0.1", None))?;
        let second = ingest(
            &mut store,
            &draft,
            &IngestOrigin::new("10.0.0.2", Some("node-b".to_string())),
        )?;

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.cycle.id, first.cycle.id);
        assert_eq!(store.list_cycles(10)?.len(), 1);

        let entries = store.provenance_for_cycle(first.cycle.id)?;
        let events = entries
            .iter()
            .map(|entry| (entry.event, entry.source_address.as_str(), entry.node_id.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                (IngestEvent::Ingest, "10.0.0.1", None),
                (IngestEvent::DuplicateIngest, "10.0.0.2", Some("node-b")),
            ]
        );

        let recent = store.list_provenance(1)?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event, IngestEvent::DuplicateIngest);
        Ok(())
    }

    // Test IDs: TING-002
    #[test]
    fn ingest_with_taken_signifier_resolves_to_stored_cycle() -> Result<()> {
        let mut store = open_memory_store()?;
        let stored = store.create_cycle(&mk_draft("alpha", 1, 0.2))?;

        let receipt = ingest(
            &mut store,
            &mk_draft("alpha", 7, 0.9),
            &IngestOrigin::new("10.0.0.1", None),
        )?;

        assert!(!receipt.created);
        assert_eq!(receipt.cycle.cycle_hash, stored.cycle_hash);
        assert_eq!(receipt.cycle.t, 1);
        Ok(())
    }

    // Test IDs: TING-003
    #[test]
    fn invalid_ingest_is_rejected_before_storage() -> Result<()> {
        let mut store = open_memory_store()?;
        let mut draft = mk_draft("alpha", 1, 0.2);
        draft.ache = f64::NAN;

        let result = ingest(&mut store, &draft, &IngestOrigin::new("10.0.0.1", None));

        assert!(matches!(result, Err(VaultError::Validation(_))));
        assert!(store.list_cycles(10)?.is_empty());
        assert!(store.list_provenance(10)?.is_empty());
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn deleting_a_cycle_cascades_to_its_provenance() -> Result<()> {
        let mut store = open_memory_store()?;
        let receipt =
            ingest(&mut store, &mk_draft("alpha", 1, 0.2), &IngestOrigin::new("10.0.0.1", None))?;
        ingest(&mut store, &mk_draft("beta", 2, 0.2), &IngestOrigin::new("10.0.0.1", None))?;

        store
            .conn
            .execute("DELETE FROM memory_cycles WHERE id = ?1", params![receipt.cycle.id.0])?;

        assert!(store.provenance_for_cycle(receipt.cycle.id)?.is_empty());
        assert_eq!(store.list_provenance(10)?.len(), 1);
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn create_rejects_duplicate_content_and_signifier() -> Result<()> {
        let mut store = open_memory_store()?;
        let draft = mk_draft("alpha", 1, 0.2);
        store.create_cycle(&draft)?;

        let Err(same_content) = store.create_cycle(&draft) else {
            return Err(anyhow!("duplicate content must be rejected"));
        };
        assert!(matches!(store_fault(&same_content), Some(StoreFault::Unique(_))));

        let Err(same_signifier) = store.create_cycle(&mk_draft("alpha", 2, 0.4)) else {
            return Err(anyhow!("duplicate signifier must be rejected"));
        };
        assert_eq!(store_fault(&same_signifier), Some(&StoreFault::Unique(UniqueKey::Signifier)));

        let mut renamed = draft.clone();
        renamed.signifier = "alpha-2".to_string();
        let hash = compute_cycle_hash(&renamed);
        store.conn.execute(
            "UPDATE memory_cycles SET cycle_hash = ?1 WHERE signifier = 'alpha'",
            params![hash],
        )?;
        let Err(same_hash) = store.create_cycle(&renamed) else {
            return Err(anyhow!("duplicate hash must be rejected"));
        };
        assert_eq!(store_fault(&same_hash), Some(&StoreFault::Unique(UniqueKey::CycleHash)));

        assert_eq!(store.list_cycles(10)?.len(), 1);
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn bulk_create_is_all_or_nothing() -> Result<()> {
        let mut store = open_memory_store()?;
        let batch =
            vec![mk_draft("alpha", 1, 0.2), mk_draft("beta", 2, 0.3), mk_draft("alpha", 3, 0.4)];

        assert!(store.create_cycles(&batch).is_err());
        assert!(store.list_cycles(10)?.is_empty());

        let created = store.create_cycles(&batch[..2])?;
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].cycle_hash, compute_cycle_hash(&batch[0]));
        assert!(created[0].id < created[1].id);
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn patch_replaces_echo_and_xi_but_keeps_hash() -> Result<()> {
        let mut store = open_memory_store()?;
        let created = store.create_cycle(&mk_draft("alpha", 1, 0.2))?;

        let patch = CyclePatch { echo_state: object(json!({"resonance": "Σ"})), xi: true };
        let Some(patched) = store.patch_cycle("alpha", &patch)? else {
            return Err(anyhow!("patched cycle must exist"));
        };

        assert_eq!(patched.echo_state, patch.echo_state);
        assert!(patched.xi);
        assert_eq!(patched.cycle_hash, created.cycle_hash);
        assert_eq!(patched.self_state, created.self_state);
        assert_eq!(patched.created_at, created.created_at);
        assert!(patched.updated_at >= created.updated_at);

        let reloaded = store.find_by_hash(&created.cycle_hash)?;
        assert_eq!(reloaded, Some(patched));

        assert_eq!(store.patch_cycle("missing", &patch)?, None);
        Ok(())
    }

    // Test IDs: TQRY-001
    #[test]
    fn latest_and_list_order_by_t_descending() -> Result<()> {
        let mut store = open_memory_store()?;
        assert_eq!(store.latest_cycle()?, None);

        store.create_cycles(&[
            mk_draft("early", 1, 0.1),
            mk_draft("late", 30, 0.1),
            mk_draft("middle", 10, 0.1),
            mk_draft("late-tie", 30, 0.1),
        ])?;

        let latest = store.latest_cycle()?.map(|cycle| cycle.signifier);
        assert_eq!(latest.as_deref(), Some("late-tie"));

        let listed =
            store.list_cycles(3)?.into_iter().map(|cycle| cycle.signifier).collect::<Vec<_>>();
        assert_eq!(listed, vec!["late-tie", "late", "middle"]);
        Ok(())
    }

    // Test IDs: TQRY-002
    #[test]
    fn stats_report_zeros_when_empty_and_means_otherwise() -> Result<()> {
        let mut store = open_memory_store()?;
        assert_eq!(
            store.stats()?,
            CycleStats {
                total_cycles: 0,
                mean_ache: 0.0,
                mean_drift: 0.0,
                mean_entropy: 0.0,
                latest_t: 0
            }
        );

        store.create_cycles(&[mk_draft("a", 4, 0.2), mk_draft("b", 9, 0.4)])?;
        let stats = store.stats()?;
        assert_eq!(stats.total_cycles, 2);
        assert!((stats.mean_ache - 0.3).abs() < 1e-9);
        assert!((stats.mean_drift - 0.1).abs() < 1e-9);
        assert_eq!(stats.latest_t, 9);
        Ok(())
    }

    // Test IDs: TQRY-003
    #[test]
    fn filter_bounds_are_inclusive_and_combined() -> Result<()> {
        let mut store = open_memory_store()?;
        store.create_cycles(&[
            mk_draft("low", 1, 0.1),
            mk_draft("edge", 5, 0.5),
            mk_draft("high", 9, 0.9),
            mk_draft("late", 50, 0.5),
        ])?;

        let filter = CycleFilter { ache_min: Some(0.5), t_max: Some(10), ..CycleFilter::default() };
        let found = store
            .query_cycles(&filter, 200)?
            .into_iter()
            .map(|cycle| cycle.signifier)
            .collect::<Vec<_>>();
        assert_eq!(found, vec!["high", "edge"]);

        assert_eq!(store.query_cycles(&CycleFilter::default(), 2)?.len(), 2);
        Ok(())
    }

    // Test IDs: TQRY-004
    #[test]
    fn aggregate_buckets_use_floor_division() -> Result<()> {
        let mut store = open_memory_store()?;
        store.create_cycles(&[
            mk_draft("n1", -1, 0.1),
            mk_draft("z0", 0, 0.2),
            mk_draft("z9", 9, 0.4),
            mk_draft("t10", 10, 0.6),
            mk_draft("n10", -10, 0.3),
            mk_draft("n11", -11, 0.5),
        ])?;

        let windows = store.aggregate_windows(10, 50)?;
        let summary =
            windows.iter().map(|window| (window.window_index, window.count)).collect::<Vec<_>>();
        assert_eq!(summary, vec![(1, 1), (0, 2), (-1, 2), (-2, 1)]);
        assert!((windows[1].avg_ache - 0.3).abs() < 1e-9);

        assert_eq!(store.aggregate_windows(10, 2)?.len(), 2);
        Ok(())
    }

    #[test]
    fn aggregate_buckets_hold_at_the_ends_of_the_t_range() -> Result<()> {
        let mut store = open_memory_store()?;
        store.create_cycles(&[
            mk_draft("lowest", i64::MIN, 0.1),
            mk_draft("highest", i64::MAX, 0.2),
            mk_draft("middle", 0, 0.3),
        ])?;

        for window in [1, 50, i64::MAX] {
            let summary = store
                .aggregate_windows(window, 10)?
                .iter()
                .map(|bucket| (bucket.window_index, bucket.count))
                .collect::<Vec<_>>();
            assert_eq!(
                summary,
                vec![
                    (i64::MAX.div_euclid(window), 1),
                    (0, 1),
                    (i64::MIN.div_euclid(window), 1),
                ],
                "window {window}"
            );
        }
        Ok(())
    }

    // Test IDs: TQRY-005
    #[test]
    fn search_matches_signifier_and_glyphs_case_insensitively() -> Result<()> {
        let mut store = open_memory_store()?;
        let mut spiral = mk_draft("Spiral-Ache", 3, 0.2);
        spiral.glyphstream = vec!["∴".to_string(), "mirror".to_string()];
        let mut percent = mk_draft("percent", 1, 0.2);
        percent.glyphstream = vec!["100% drift".to_string()];
        store.create_cycles(&[spiral, percent, mk_draft("plain", 2, 0.2)])?;

        let by_signifier = store.search_cycles("spiral", 50)?;
        assert_eq!(by_signifier.len(), 1);

        let by_glyph = store.search_cycles("MIRROR", 50)?;
        assert_eq!(by_glyph.first().map(|cycle| cycle.signifier.as_str()), Some("Spiral-Ache"));

        let literal_percent = store.search_cycles("%", 50)?;
        assert_eq!(
            literal_percent.into_iter().map(|cycle| cycle.signifier).collect::<Vec<_>>(),
            vec!["percent"]
        );

        assert!(store.search_cycles("_", 50)?.is_empty());
        Ok(())
    }

    #[test]
    fn filter_clause_numbers_placeholders_in_predicate_order() {
        let (clause, values) = filter_clause(&[
            RangePredicate {
                column: FilterColumn::Drift,
                bound: Bound::Min,
                value: FilterValue::Float(0.25),
            },
            RangePredicate {
                column: FilterColumn::T,
                bound: Bound::Max,
                value: FilterValue::Integer(9),
            },
        ]);
        assert_eq!(clause, " WHERE drift >= ?1 AND t <= ?2");
        assert_eq!(values, vec![SqlValue::Real(0.25), SqlValue::Integer(9)]);

        let (empty_clause, empty_values) = filter_clause(&[]);
        assert!(empty_clause.is_empty());
        assert!(empty_values.is_empty());
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("a%b_c\\"), "%a\\%b\\_c\\\\%");
    }

    // Test IDs: TDB-007
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = open_memory_store()?;
        ingest(&mut store, &mk_draft("alpha", 1, 0.2), &IngestOrigin::new("10.0.0.1", None))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.cycle_count, 1);
        assert_eq!(report.provenance_count, 1);
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_identical_ingests_store_one_cycle() -> Result<()> {
        let db_path = unique_temp_db_path();
        {
            let init = SqliteStore::open(&db_path)?;
            init.ensure_schema()?;
        }

        let ingest_threads = 8;
        let mut handles = Vec::new();
        for index in 0..ingest_threads {
            let thread_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<bool> {
                let mut store = SqliteStore::open(&thread_path)?;
                let origin = IngestOrigin::new(format!("10.0.0.{index}"), None);
                let receipt = ingest(&mut store, &mk_draft("contended", 7, 0.5), &origin)?;
                Ok(receipt.created)
            }));
        }

        let mut created = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("ingest thread panicked"));
            };
            if thread_result? {
                created += 1;
            }
        }

        let store = SqliteStore::open(&db_path)?;
        assert_eq!(created, 1);
        assert_eq!(store.list_cycles(10)?.len(), 1);

        let entries = store.list_provenance(100)?;
        assert_eq!(entries.len(), ingest_threads);
        assert_eq!(entries.iter().filter(|entry| entry.event == IngestEvent::Ingest).count(), 1);

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());

        drop(store);
        remove_db_files(&db_path)
    }
}
