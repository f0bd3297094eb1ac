//! Test case definitions and their store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{json_column, time_column, unblock, Pool, StoreError};

/// How a test case is executed: `program args... spec [filter]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Spec file (or other target) handed to the program.
    pub spec: String,
    /// Optional selector passed behind the configured filter flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

fn default_program() -> String {
    "npx".to_string()
}

fn default_args() -> Vec<String> {
    vec!["playwright".to_string(), "test".to_string()]
}

impl CommandSpec {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            spec: spec.into(),
            filter: None,
        }
    }
}

/// A stored test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub command: CommandSpec,
    pub env: BTreeMap<String, String>,
    pub actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields submitted when creating a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTestCase {
    pub name: String,
    pub command: CommandSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasePatch {
    pub name: Option<String>,
    pub command: Option<CommandSpec>,
    pub env: Option<BTreeMap<String, String>>,
    pub actions: Option<Vec<String>>,
}

const SELECT_CASE: &str =
    "SELECT id, name, command_json, env_json, actions_json, created_at, updated_at FROM test_cases";

fn map_case(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    Ok(TestCase {
        id: row.get(0)?,
        name: row.get(1)?,
        command: json_column(row, 2)?,
        env: json_column(row, 3)?,
        actions: json_column(row, 4)?,
        created_at: time_column(row, 5)?,
        updated_at: time_column(row, 6)?,
    })
}

/// CRUD access to test cases.
#[derive(Clone)]
pub struct CaseStore {
    pool: Pool,
}

impl CaseStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Call `f` with this store on the blocking thread pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&CaseStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        unblock(move || f(&store)).await
    }

    pub fn create(&self, new: NewTestCase) -> Result<TestCase, StoreError> {
        let now = Utc::now();
        let case = TestCase {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            command: new.command,
            env: new.env,
            actions: new.actions,
            created_at: now,
            updated_at: now,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO test_cases (id, name, command_json, env_json, actions_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                case.id,
                case.name,
                serde_json::to_string(&case.command)?,
                serde_json::to_string(&case.env)?,
                serde_json::to_string(&case.actions)?,
                case.created_at.to_rfc3339(),
                case.updated_at.to_rfc3339(),
            ],
        )?;

        tracing::debug!(case_id = %case.id, name = %case.name, "test case created");
        Ok(case)
    }

    pub fn get(&self, id: &str) -> Result<Option<TestCase>, StoreError> {
        let conn = self.pool.get()?;
        let case = conn
            .query_row(&format!("{SELECT_CASE} WHERE id = ?1"), params![id], map_case)
            .optional()?;
        Ok(case)
    }

    pub fn list(&self) -> Result<Vec<TestCase>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{SELECT_CASE} ORDER BY created_at, id"))?;
        let rows = stmt.query_map([], map_case)?;

        let mut cases = Vec::new();
        for r in rows {
            cases.push(r?);
        }
        Ok(cases)
    }

    /// Read-modify-write under an immediate transaction.
    pub fn update(&self, id: &str, patch: CasePatch) -> Result<TestCase, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut case = tx
            .query_row(&format!("{SELECT_CASE} WHERE id = ?1"), params![id], map_case)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: "test case",
                id: id.to_string(),
            })?;

        if let Some(name) = patch.name {
            case.name = name;
        }
        if let Some(command) = patch.command {
            case.command = command;
        }
        if let Some(env) = patch.env {
            case.env = env;
        }
        if let Some(actions) = patch.actions {
            case.actions = actions;
        }
        case.updated_at = Utc::now();

        tx.execute(
            "UPDATE test_cases
             SET name = ?2, command_json = ?3, env_json = ?4, actions_json = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                case.id,
                case.name,
                serde_json::to_string(&case.command)?,
                serde_json::to_string(&case.env)?,
                serde_json::to_string(&case.actions)?,
                case.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(case)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM test_cases WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "test case",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
