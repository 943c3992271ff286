//! Todo data access
//!
//! Reads and writes the `todos` table through the process-wide pool owned by
//! [`ConnectionManager`].

use crate::connection::ConnectionManager;
use crate::db::ConnectionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio_postgres::Row;
use tracing::debug;

const TODO_COLUMNS: &str = "id, slug, task, status, created_at, updated_at";

/// Largest page `list` will return
pub const MAX_PAGE_SIZE: i64 = 500;

#[derive(Error, Debug)]
pub enum TodoError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Todo {0} not found")]
    NotFound(i64),

    #[error("Invalid list parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Row of the `todos` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: i64,
    pub slug: String,
    pub task: String,
    /// Done flag
    pub status: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Todo {
    fn from_row(row: &Row) -> Self {
        Self {
            id: row.get(0),
            slug: row.get(1),
            task: row.get(2),
            status: row.get(3),
            created_at: row.get(4),
            updated_at: row.get(5),
        }
    }
}

/// Writable fields of a todo
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TodoInput {
    pub slug: String,
    pub task: String,
    #[serde(default)]
    pub status: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = TodoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(TodoError::InvalidParameter {
                name: "order",
                reason: format!("expected asc or desc, got {other:?}"),
            }),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Filter and page for [`TodoService::list`]; pages start at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub status: bool,
    pub page: i64,
    pub page_size: i64,
    pub order: SortOrder,
}

impl ListQuery {
    pub fn new(status: bool, page: i64, page_size: i64, order: SortOrder) -> Result<Self, TodoError> {
        if page < 1 {
            return Err(TodoError::InvalidParameter {
                name: "page",
                reason: format!("must be at least 1, got {page}"),
            });
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(TodoError::InvalidParameter {
                name: "page_size",
                reason: format!("must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"),
            });
        }
        Ok(Self {
            status,
            page,
            page_size,
            order,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }

    fn sql(&self) -> String {
        format!(
            "SELECT {TODO_COLUMNS} FROM todos WHERE status = $1 \
             ORDER BY updated_at {}, id {} LIMIT $2 OFFSET $3",
            self.order, self.order
        )
    }
}

/// CRUD over `todos`
#[derive(Clone)]
pub struct TodoService {
    connections: Arc<ConnectionManager>,
}

impl TodoService {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Vec<Todo>, TodoError> {
        let client = self.connections.db()?.get().await?;
        let rows = client
            .query(
                &query.sql(),
                &[&query.status, &query.page_size, &query.offset()],
            )
            .await?;

        debug!(rows = rows.len(), page = query.page, "Fetched todos");
        Ok(rows.iter().map(Todo::from_row).collect())
    }

    pub async fn get(&self, id: i64) -> Result<Todo, TodoError> {
        let client = self.connections.db()?.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = $1"),
                &[&id],
            )
            .await?;

        row.as_ref().map(Todo::from_row).ok_or(TodoError::NotFound(id))
    }

    pub async fn create(&self, input: &TodoInput) -> Result<Todo, TodoError> {
        let client = self.connections.db()?.get().await?;
        let now = Utc::now();
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO todos (slug, task, status, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $4) RETURNING {TODO_COLUMNS}"
                ),
                &[&input.slug, &input.task, &input.status, &now],
            )
            .await?;

        Ok(Todo::from_row(&row))
    }

    /// Replace the writable fields; `created_at` is kept
    pub async fn update(&self, id: i64, input: &TodoInput) -> Result<Todo, TodoError> {
        let client = self.connections.db()?.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE todos SET slug = $2, task = $3, status = $4, updated_at = $5 \
                     WHERE id = $1 RETURNING {TODO_COLUMNS}"
                ),
                &[&id, &input.slug, &input.task, &input.status, &Utc::now()],
            )
            .await?;

        row.as_ref().map(Todo::from_row).ok_or(TodoError::NotFound(id))
    }

    /// Number of rows removed, 0 when `id` does not exist
    pub async fn delete(&self, id: i64) -> Result<u64, TodoError> {
        let client = self.connections.db()?.get().await?;
        Ok(client.execute("DELETE FROM todos WHERE id = $1", &[&id]).await?)
    }
}
