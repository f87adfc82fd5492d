//! Deployment and per-client status storage.
//!
//! Every status mutation goes through [`Store::transition_status`], a
//! conditional `UPDATE` keyed on the row's current state. A transition whose
//! precondition no longer holds changes nothing and reports
//! [`DbError::Conflict`] with the state it found.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::models::*;
use super::store::*;

/// A state change requested for one status row.
///
/// Every variant carries a log line appended to the row's `log_output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// pending -> in_progress
    Start { log: String },
    /// in_progress -> completed, from an agent result
    Complete { log: String },
    /// in_progress -> failed, from an agent result
    Fail { error: String, log: String },
    /// pending | in_progress -> failed, when the server gives up on a row
    /// (client offline, dispatch or delivery exhausted)
    Abort { error: String, log: String },
    /// pending | in_progress -> cancelled
    Cancel { log: String },
    /// failed -> pending, clearing timestamps and error
    Reset { log: String },
}

impl Transition {
    pub fn target(&self) -> RowState {
        match self {
            Transition::Start { .. } => RowState::InProgress,
            Transition::Complete { .. } => RowState::Completed,
            Transition::Fail { .. } | Transition::Abort { .. } => RowState::Failed,
            Transition::Cancel { .. } => RowState::Cancelled,
            Transition::Reset { .. } => RowState::Pending,
        }
    }

    /// States the row must currently be in for the transition to apply.
    pub fn allowed_from(&self) -> &'static [RowState] {
        match self {
            Transition::Start { .. } => &[RowState::Pending],
            Transition::Complete { .. } | Transition::Fail { .. } => &[RowState::InProgress],
            Transition::Abort { .. } | Transition::Cancel { .. } => {
                &[RowState::InProgress, RowState::Pending]
            }
            Transition::Reset { .. } => &[RowState::Failed],
        }
    }

    fn log(&self) -> &str {
        match self {
            Transition::Start { log }
            | Transition::Complete { log }
            | Transition::Fail { log, .. }
            | Transition::Abort { log, .. }
            | Transition::Cancel { log }
            | Transition::Reset { log } => log,
        }
    }
}

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub package_id: Option<i64>,
    /// Deployments that target this client.
    pub client_id: Option<i64>,
    pub created_by: Option<String>,
    /// Substring match on description or package name.
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Filter criteria for listing status rows.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub deployment_id: Option<i64>,
    pub client_id: Option<i64>,
    pub state: Option<RowState>,
}

/// A transition that took effect.
#[derive(Debug, Clone)]
pub struct Applied {
    /// The state the transition replaced.
    pub previous: RowState,
    pub row: DeploymentStatus,
}

const STATUS_COLUMNS: &str =
    "id, deployment_id, client_id, status, started_at, completed_at, error_message, log_output";

impl Store {
    /// Insert a deployment and one pending status row per target client in
    /// a single transaction. Either everything is written or nothing is.
    pub fn create_deployment_with_statuses(
        &self,
        deployment: &NewDeployment,
        now: DateTime<Utc>,
    ) -> Result<Deployment, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO deployments (package_id, description, created_by, created_at, scheduled_for)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                deployment.package_id,
                deployment.description,
                deployment.created_by,
                fmt_db_time(&now),
                deployment.scheduled_for.as_ref().map(fmt_db_time),
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO deployment_statuses (deployment_id, client_id, position, status)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, client_id) in deployment.client_ids.iter().enumerate() {
                stmt.execute(params![id, client_id, position as i64, RowState::Pending])?;
            }
        }

        let created = query_deployment(&tx, id)?;
        tx.commit()?;
        Ok(created)
    }

    /// Read a deployment with its package and status rows (each joined with
    /// its client) as one consistent snapshot.
    pub fn get_deployment_detail(&self, id: i64) -> Result<DeploymentDetail, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let detail = query_detail(&tx, id)?;
        tx.commit()?;
        Ok(detail)
    }

    /// List deployment snapshots matching the filter, newest first.
    pub fn list_deployment_details(
        &self,
        filter: &DeploymentFilter,
    ) -> Result<Vec<DeploymentDetail>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let mut sql = String::from(
            "SELECT d.id FROM deployments d JOIN packages p ON p.id = d.package_id WHERE 1=1",
        );
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(package_id) = filter.package_id {
            args.push(Box::new(package_id));
            sql.push_str(&format!(" AND d.package_id = ?{}", args.len()));
        }
        if let Some(client_id) = filter.client_id {
            args.push(Box::new(client_id));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM deployment_statuses s WHERE s.deployment_id = d.id AND s.client_id = ?{})",
                args.len()
            ));
        }
        if let Some(created_by) = &filter.created_by {
            args.push(Box::new(created_by.clone()));
            sql.push_str(&format!(" AND d.created_by = ?{}", args.len()));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            args.push(Box::new(format!("%{}%", search)));
            let n = args.len();
            sql.push_str(&format!(" AND (d.description LIKE ?{n} OR p.name LIKE ?{n})"));
        }
        sql.push_str(" ORDER BY d.created_at DESC, d.id DESC");
        if filter.limit.is_some() || filter.offset.is_some() {
            let limit = filter.limit.map_or(-1, i64::from);
            sql.push_str(&format!(
                " LIMIT {} OFFSET {}",
                limit,
                filter.offset.unwrap_or(0)
            ));
        }

        let ids = {
            let mut stmt = tx.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(args.iter()), |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let details = ids
            .into_iter()
            .map(|id| query_detail(&tx, id))
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit()?;
        Ok(details)
    }

    /// Get a status row by ID.
    pub fn get_status(&self, id: i64) -> Result<DeploymentStatus, DbError> {
        let conn = self.conn()?;
        query_status(&conn, id)
    }

    /// Get the status row for a (deployment, client) pair.
    pub fn get_status_for_client(
        &self,
        deployment_id: i64,
        client_id: i64,
    ) -> Result<DeploymentStatus, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM deployment_statuses WHERE deployment_id = ?1 AND client_id = ?2",
                STATUS_COLUMNS
            ),
            params![deployment_id, client_id],
            |row| status_from_row(row, 0),
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get all status rows of a deployment in request order.
    pub fn get_statuses(&self, deployment_id: i64) -> Result<Vec<DeploymentStatus>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM deployment_statuses WHERE deployment_id = ?1 ORDER BY position ASC",
            STATUS_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![deployment_id], |row| status_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get status rows matching the filter, most recently started first.
    /// Rows that never started come last.
    pub fn find_statuses(&self, filter: &StatusFilter) -> Result<Vec<DeploymentStatus>, DbError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {} FROM deployment_statuses WHERE 1=1", STATUS_COLUMNS);
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(deployment_id) = filter.deployment_id {
            args.push(Box::new(deployment_id));
            sql.push_str(&format!(" AND deployment_id = ?{}", args.len()));
        }
        if let Some(client_id) = filter.client_id {
            args.push(Box::new(client_id));
            sql.push_str(&format!(" AND client_id = ?{}", args.len()));
        }
        if let Some(state) = filter.state {
            args.push(Box::new(state));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY started_at IS NULL, started_at DESC, id DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| status_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Atomically apply `transition` to a status row if its current state
    /// permits it.
    ///
    /// `started_at` is set the first time the row leaves `pending`;
    /// `completed_at` is set on entry to a terminal state. A row in a state
    /// the transition does not accept is left untouched and
    /// [`DbError::Conflict`] is returned.
    pub fn apply_transition(
        &self,
        status_id: i64,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<DeploymentStatus, DbError> {
        self.transition_status(status_id, transition, now)
            .map(|applied| applied.row)
    }

    /// Like [`Store::apply_transition`], also reporting the state that was
    /// replaced.
    ///
    /// The `UPDATE` is conditioned on the exact state read under the same
    /// connection lock, so `previous` is the state the change replaced even
    /// when other writers race on the row.
    pub fn transition_status(
        &self,
        status_id: i64,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Applied, DbError> {
        let conn = self.conn()?;
        let previous = query_status(&conn, status_id)?.state;
        if !transition.allowed_from().contains(&previous) {
            return Err(DbError::Conflict {
                status_id,
                current: previous,
            });
        }

        let changed = match transition {
            Transition::Reset { log } => conn.execute(
                "UPDATE deployment_statuses
                 SET status = ?1, started_at = NULL, completed_at = NULL, error_message = NULL,
                     log_output = log_output || ?2
                 WHERE id = ?3 AND status = ?4",
                params![RowState::Pending, log, status_id, previous],
            )?,
            _ => {
                let target = transition.target();
                let now_str = fmt_db_time(&now);
                let completed_at = target.is_terminal().then(|| now_str.clone());
                let error = match transition {
                    Transition::Fail { error, .. } | Transition::Abort { error, .. } => {
                        Some(error.as_str())
                    }
                    _ => None,
                };
                conn.execute(
                    "UPDATE deployment_statuses
                     SET status = ?1,
                         started_at = COALESCE(started_at, ?2),
                         completed_at = COALESCE(?3, completed_at),
                         error_message = COALESCE(?4, error_message),
                         log_output = log_output || ?5
                     WHERE id = ?6 AND status = ?7",
                    params![target, now_str, completed_at, error, transition.log(), status_id, previous],
                )?
            }
        };

        let row = query_status(&conn, status_id)?;
        if changed == 0 {
            return Err(DbError::Conflict {
                status_id,
                current: row.state,
            });
        }
        Ok(Applied { previous, row })
    }

    /// IDs of deployments that hold pending rows and whose schedule has arrived.
    pub fn due_deployment_ids(&self, now: DateTime<Utc>) -> Result<Vec<i64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT d.id FROM deployments d
             JOIN deployment_statuses s ON s.deployment_id = d.id
             WHERE s.status = ?1 AND (d.scheduled_for IS NULL OR d.scheduled_for <= ?2)
             ORDER BY d.id ASC",
        )?;
        let ids = stmt
            .query_map(params![RowState::Pending, fmt_db_time(&now)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Rows still in progress that started before `cutoff`.
    pub fn stale_in_progress(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeploymentStatus>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM deployment_statuses WHERE status = ?1 AND started_at < ?2 ORDER BY id ASC",
            STATUS_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![RowState::InProgress, fmt_db_time(&cutoff)], |row| {
                status_from_row(row, 0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn query_deployment(conn: &Connection, id: i64) -> Result<Deployment, DbError> {
    let mut deployment = conn
        .query_row(
            "SELECT id, package_id, description, created_by, created_at, scheduled_for
             FROM deployments WHERE id = ?1",
            params![id],
            |row| {
                Ok(Deployment {
                    id: row.get(0)?,
                    package_id: row.get(1)?,
                    client_ids: Vec::new(),
                    description: row.get(2)?,
                    created_by: row.get(3)?,
                    created_at: time_col(row, 4)?,
                    scheduled_for: opt_time_col(row, 5)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)?;

    let mut stmt = conn.prepare(
        "SELECT client_id FROM deployment_statuses WHERE deployment_id = ?1 ORDER BY position ASC",
    )?;
    deployment.client_ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(deployment)
}

fn query_detail(conn: &Connection, id: i64) -> Result<DeploymentDetail, DbError> {
    let deployment = query_deployment(conn, id)?;
    let package = query_package(conn, deployment.package_id)?;

    let sql = format!(
        "SELECT s.id, s.deployment_id, s.client_id, s.status, s.started_at, s.completed_at,
                s.error_message, s.log_output, {}
         FROM deployment_statuses s JOIN clients c ON c.id = s.client_id
         WHERE s.deployment_id = ?1 ORDER BY s.position ASC",
        CLIENT_COLUMNS
            .split(", ")
            .map(|col| format!("c.{}", col))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let statuses = stmt
        .query_map(params![id], |row| {
            Ok(StatusDetail {
                status: status_from_row(row, 0)?,
                client: client_from_row(row, 8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(DeploymentDetail {
        deployment,
        package,
        statuses,
    })
}

fn query_status(conn: &Connection, id: i64) -> Result<DeploymentStatus, DbError> {
    conn.query_row(
        &format!("SELECT {} FROM deployment_statuses WHERE id = ?1", STATUS_COLUMNS),
        params![id],
        |row| status_from_row(row, 0),
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

fn status_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<DeploymentStatus> {
    Ok(DeploymentStatus {
        id: row.get(at)?,
        deployment_id: row.get(at + 1)?,
        client_id: row.get(at + 2)?,
        state: row.get(at + 3)?,
        started_at: opt_time_col(row, at + 4)?,
        completed_at: opt_time_col(row, at + 5)?,
        error_message: row.get(at + 6)?,
        log_output: row.get(at + 7)?,
    })
}
