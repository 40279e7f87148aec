use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: u32 = 20;
const MAX_LIST_LIMIT: u32 = 100;

/// A persisted workflow. `definition` is opaque JSON owned by the editor;
/// `includes` are references to other workflows of the same owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub definition: serde_json::Value,
    pub includes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update; only present fields are written.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub definition: Option<serde_json::Value>,
    pub includes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowPage {
    pub workflows: Vec<WorkflowRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum IncludeValidationError {
    #[error("workflow cannot include itself")]
    SelfReference,

    #[error("one or more included workflows do not exist")]
    MissingReference,

    #[error("cannot include workflows owned by another user")]
    CrossOwnerReference,

    #[error("circular dependency detected in workflow includes")]
    CycleDetected,
}

#[derive(Debug, Error)]
pub enum WorkflowStoreError {
    #[error("workflow not found")]
    NotFound,

    #[error(transparent)]
    Includes(#[from] IncludeValidationError),

    #[error("workflow storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Workflow persistence over a single-file sqlite database in the data
/// directory.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    db_path: PathBuf,
}

impl WorkflowStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for workflows db: {}",
                data_dir.display()
            )
        })?;

        let store = Self {
            db_path: data_dir.join("workflows.db"),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn create(
        &self,
        owner_id: &str,
        name: &str,
        description: Option<&str>,
        definition: Option<serde_json::Value>,
    ) -> Result<WorkflowRecord, WorkflowStoreError> {
        let now = Utc::now();
        let record = WorkflowRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            definition: definition.unwrap_or_else(|| serde_json::json!({})),
            includes: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workflows (
                    id, owner_id, name, description, definition, includes,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.owner_id,
                    record.name,
                    record.description,
                    serde_json::to_string(&record.definition)
                        .context("failed to serialize workflow definition")?,
                    serde_json::to_string(&record.includes)
                        .context("failed to serialize workflow includes")?,
                    encode_timestamp(record.created_at),
                    encode_timestamp(record.updated_at),
                ],
            )
            .with_context(|| format!("failed to insert workflow {}", record.id))?;
            Ok(())
        })?;

        Ok(record)
    }

    pub fn get(&self, workflow_id: &str) -> Result<WorkflowRecord, WorkflowStoreError> {
        self.fetch_one("SELECT * FROM workflows WHERE id = ?1", params![workflow_id])
    }

    /// Owner-scoped fetch; a workflow of another owner reads as not found.
    pub fn get_owned(
        &self,
        owner_id: &str,
        workflow_id: &str,
    ) -> Result<WorkflowRecord, WorkflowStoreError> {
        self.fetch_one(
            "SELECT * FROM workflows WHERE id = ?1 AND owner_id = ?2",
            params![workflow_id, owner_id],
        )
    }

    /// Marketplace listing, newest update first. The cursor is the previous
    /// page's last `updated_at` value.
    pub fn list(
        &self,
        limit: Option<u32>,
        cursor: Option<&str>,
    ) -> Result<WorkflowPage, WorkflowStoreError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

        let mut rows: Vec<WorkflowRecord> = self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM workflows
                 WHERE (?1 IS NULL OR updated_at < ?1)
                 ORDER BY updated_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let fetched = stmt
                .query_map(params![cursor, limit + 1], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to read workflow rows")?;
            Ok(fetched)
        })?;

        let has_more = rows.len() as u32 > limit;
        if has_more {
            rows.truncate(limit as usize);
        }
        let next_cursor = if has_more {
            rows.last().map(|record| encode_timestamp(record.updated_at))
        } else {
            None
        };

        Ok(WorkflowPage {
            workflows: rows,
            next_cursor,
        })
    }

    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<WorkflowRecord>, WorkflowStoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM workflows WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC",
            )?;
            let fetched = stmt
                .query_map(params![owner_id], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to read owner workflow rows")?;
            Ok(fetched)
        })
        .map_err(WorkflowStoreError::from)
    }

    /// Apply a partial update. Includes are validated before anything is
    /// written, so a rejected patch leaves the record untouched.
    pub fn update(
        &self,
        owner_id: &str,
        workflow_id: &str,
        patch: WorkflowPatch,
    ) -> Result<WorkflowRecord, WorkflowStoreError> {
        let mut record = self.get_owned(owner_id, workflow_id)?;

        if let Some(includes) = &patch.includes {
            self.validate_includes(owner_id, workflow_id, includes)?;
        }

        if let Some(name) = patch.name {
            record.name = name;
        }
        if let Some(description) = patch.description {
            record.description = Some(description);
        }
        if let Some(definition) = patch.definition {
            record.definition = definition;
        }
        if let Some(includes) = patch.includes {
            record.includes = includes;
        }
        record.updated_at = Utc::now();

        let updated_rows = self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE workflows SET
                        name = ?1, description = ?2, definition = ?3,
                        includes = ?4, updated_at = ?5
                     WHERE id = ?6 AND owner_id = ?7",
                    params![
                        record.name,
                        record.description,
                        serde_json::to_string(&record.definition)
                            .context("failed to serialize workflow definition")?,
                        serde_json::to_string(&record.includes)
                            .context("failed to serialize workflow includes")?,
                        encode_timestamp(record.updated_at),
                        workflow_id,
                        owner_id,
                    ],
                )
                .with_context(|| format!("failed to update workflow {workflow_id}"))?;
            Ok(changed)
        })?;

        if updated_rows == 0 {
            return Err(WorkflowStoreError::NotFound);
        }

        Ok(record)
    }

    pub fn delete(&self, owner_id: &str, workflow_id: &str) -> Result<(), WorkflowStoreError> {
        let deleted_rows = self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM workflows WHERE id = ?1 AND owner_id = ?2",
                    params![workflow_id, owner_id],
                )
                .with_context(|| format!("failed to delete workflow {workflow_id}"))?;
            Ok(changed)
        })?;

        if deleted_rows == 0 {
            return Err(WorkflowStoreError::NotFound);
        }

        Ok(())
    }

    /// Validate a proposed includes list for `workflow_id`. Checks run in
    /// order: self-reference, existence, ownership, cycles. Only when all
    /// pass may the update proceed to persistence.
    pub fn validate_includes(
        &self,
        owner_id: &str,
        workflow_id: &str,
        new_includes: &[String],
    ) -> Result<(), WorkflowStoreError> {
        if new_includes.is_empty() {
            return Ok(());
        }

        if new_includes.iter().any(|id| id == workflow_id) {
            return Err(IncludeValidationError::SelfReference.into());
        }

        let unique_ids: HashSet<&String> = new_includes.iter().collect();
        let mut referenced = Vec::with_capacity(unique_ids.len());
        for id in &unique_ids {
            match self.get(id) {
                Ok(record) => referenced.push(record),
                Err(WorkflowStoreError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        if referenced.len() != new_includes.len() {
            return Err(IncludeValidationError::MissingReference.into());
        }

        if referenced.iter().any(|record| record.owner_id != owner_id) {
            return Err(IncludeValidationError::CrossOwnerReference.into());
        }

        let mut adjacency: HashMap<String, Vec<String>> = self
            .list_by_owner(owner_id)?
            .into_iter()
            .map(|record| (record.id, record.includes))
            .collect();
        adjacency.insert(workflow_id.to_string(), new_includes.to_vec());

        if has_cycle_from(&adjacency, workflow_id) {
            return Err(IncludeValidationError::CycleDetected.into());
        }

        Ok(())
    }

    fn fetch_one(
        &self,
        query: &str,
        query_params: impl rusqlite::Params,
    ) -> Result<WorkflowRecord, WorkflowStoreError> {
        let record = self.with_connection(|conn| {
            let mut stmt = conn.prepare(query)?;
            let mut rows = stmt
                .query_map(query_params, row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to read workflow row")?;
            Ok(rows.pop())
        })?;

        record.ok_or(WorkflowStoreError::NotFound)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS workflows (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    definition TEXT NOT NULL,
                    includes TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_workflows_owner ON workflows(owner_id);
                 CREATE INDEX IF NOT EXISTS idx_workflows_updated_at
                    ON workflows(updated_at DESC);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize workflows schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open workflows db: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set workflows db busy timeout")?;
        op(&conn)
    }
}

/// DFS from `start` tracking the current path. A node popped off the path
/// may be reached again later (shared diamond includes are legal); only a
/// revisit while still on the path is a cycle.
fn has_cycle_from(graph: &HashMap<String, Vec<String>>, start: &str) -> bool {
    fn dfs(
        graph: &HashMap<String, Vec<String>>,
        node: &str,
        visited: &mut HashSet<String>,
        in_path: &mut HashSet<String>,
    ) -> bool {
        if in_path.contains(node) {
            return true;
        }
        if visited.contains(node) {
            return false;
        }

        visited.insert(node.to_string());
        in_path.insert(node.to_string());

        if let Some(neighbors) = graph.get(node) {
            for neighbor in neighbors {
                if dfs(graph, neighbor, visited, in_path) {
                    return true;
                }
            }
        }

        in_path.remove(node);
        false
    }

    let mut visited = HashSet::new();
    let mut in_path = HashSet::new();
    dfs(graph, start, &mut visited, &mut in_path)
}

fn encode_timestamp(ts: DateTime<Utc>) -> String {
    // Fixed fractional width keeps lexicographic order equal to time order,
    // which the keyset pagination relies on.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
        .map(|ts| ts.with_timezone(&Utc))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRecord> {
    let definition_raw: String = row.get("definition")?;
    let includes_raw: String = row.get("includes")?;
    let created_raw: String = row.get("created_at")?;
    let updated_raw: String = row.get("updated_at")?;

    let invalid = |idx: usize, err: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    };

    Ok(WorkflowRecord {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        definition: serde_json::from_str(&definition_raw)
            .map_err(|err| invalid(4, err.to_string()))?,
        includes: serde_json::from_str(&includes_raw)
            .map_err(|err| invalid(5, err.to_string()))?,
        created_at: parse_timestamp(&created_raw).map_err(|err| invalid(6, err.to_string()))?,
        updated_at: parse_timestamp(&updated_raw).map_err(|err| invalid(7, err.to_string()))?,
    })
}
