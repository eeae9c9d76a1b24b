//! Tasks.

use chrono::{DateTime, Utc};
use pipewright_types::{HumanStatus, Task, TaskStatus};
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;
use uuid::Uuid;

use crate::rows::{col_bool, col_dt, col_json, col_opt_dt, col_parse, col_uuid, fmt_dt};
use crate::{Result, StoreError, Tx};

const TASK_COLUMNS: &str = "t.id, t.work_number, t.work_title, t.version_id, t.author, t.initiator, \
     t.parameters, t.status, t.human_status, t.human_status_comment, t.started_at, \
     t.last_changed_at, t.finished_at, t.rate, t.rate_comment, t.is_test, t.is_paused, \
     t.parent_work_number, t.child_work_number";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: col_uuid(row, 0)?,
        work_number: row.get(1)?,
        work_title: row.get(2)?,
        version_id: col_uuid(row, 3)?,
        author: row.get(4)?,
        initiator: row.get(5)?,
        parameters: col_json(row, 6)?,
        status: col_parse(row, 7)?,
        human_status: col_parse(row, 8)?,
        human_status_comment: row.get(9)?,
        started_at: col_dt(row, 10)?,
        last_changed_at: col_dt(row, 11)?,
        finished_at: col_opt_dt(row, 12)?,
        rate: row.get(13)?,
        rate_comment: row.get(14)?,
        is_test: col_bool(row, 15)?,
        is_paused: col_bool(row, 16)?,
        parent_work_number: row.get(17)?,
        child_work_number: row.get(18)?,
    })
}

/// Input for [`Tx::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub version_id: Uuid,
    pub work_title: String,
    pub author: String,
    pub initiator: String,
    pub parameters: Value,
    pub is_test: bool,
    pub parent_work_number: Option<i64>,
}

/// Listing filter for tasks. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub initiator: Option<String>,
    /// Visible to any of these logins: initiator or a step member.
    pub visible_to: Option<Vec<String>>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub version_id: Option<Uuid>,
    pub pipeline_id: Option<Uuid>,
    pub is_test: Option<bool>,
    pub newest_first: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl TaskFilter {
    fn where_clause(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conds: Vec<String> = vec!["1 = 1".to_string()];
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(initiator) = &self.initiator {
            values.push(Box::new(initiator.clone()));
            conds.push(format!("t.initiator = ?{}", values.len()));
        }
        if let Some(logins) = &self.visible_to {
            let mut slots = Vec::new();
            for login in logins {
                values.push(Box::new(login.clone()));
                slots.push(format!("?{}", values.len()));
            }
            let list = if slots.is_empty() {
                "NULL".to_string()
            } else {
                slots.join(", ")
            };
            conds.push(format!(
                "(t.initiator IN ({list}) OR EXISTS (SELECT 1 FROM steps s JOIN step_members m ON m.step_id = s.id
                  WHERE s.task_id = t.id AND m.login IN ({list})))"
            ));
        }
        if let Some(statuses) = &self.statuses {
            let mut slots = Vec::new();
            for status in statuses {
                values.push(Box::new(status.as_str()));
                slots.push(format!("?{}", values.len()));
            }
            if slots.is_empty() {
                conds.push("0 = 1".to_string());
            } else {
                conds.push(format!("t.status IN ({})", slots.join(", ")));
            }
        }
        if let Some(version_id) = self.version_id {
            values.push(Box::new(version_id.to_string()));
            conds.push(format!("t.version_id = ?{}", values.len()));
        }
        if let Some(pipeline_id) = self.pipeline_id {
            values.push(Box::new(pipeline_id.to_string()));
            conds.push(format!(
                "t.version_id IN (SELECT id FROM versions WHERE pipeline_id = ?{})",
                values.len()
            ));
        }
        if let Some(is_test) = self.is_test {
            values.push(Box::new(is_test as i64));
            conds.push(format!("t.is_test = ?{}", values.len()));
        }
        (conds.join(" AND "), values)
    }
}

impl Tx<'_> {
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        let work_number: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(work_number), 0) + 1 FROM tasks",
            [],
            |row| row.get(0),
        )?;
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            work_number,
            work_title: new.work_title,
            version_id: new.version_id,
            author: new.author,
            initiator: new.initiator,
            parameters: new.parameters,
            status: TaskStatus::Created,
            human_status: HumanStatus::New,
            human_status_comment: String::new(),
            started_at: now,
            last_changed_at: now,
            finished_at: None,
            rate: None,
            rate_comment: None,
            is_test: new.is_test,
            is_paused: false,
            parent_work_number: new.parent_work_number,
            child_work_number: None,
        };
        self.conn().execute(
            "INSERT INTO tasks (id, work_number, work_title, version_id, author, initiator, parameters,
                                status, human_status, started_at, last_changed_at, is_test, parent_work_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12)",
            params![
                task.id.to_string(),
                task.work_number,
                task.work_title,
                task.version_id.to_string(),
                task.author,
                task.initiator,
                serde_json::to_string(&task.parameters)?,
                task.status.as_str(),
                task.human_status.as_str(),
                fmt_dt(&now),
                task.is_test as i64,
                task.parent_work_number
            ],
        )?;
        tracing::debug!(work_number, task_id = %task.id, "task created");
        Ok(task)
    }

    pub fn get_task(&self, id: Uuid) -> Result<Task> {
        self.conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
                params![id.to_string()],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    pub fn get_task_by_work_number(&self, work_number: i64) -> Result<Task> {
        self.conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.work_number = ?1"),
                params![work_number],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("task", work_number))
    }

    /// Whether any of `logins` initiated the task or is a member of one of
    /// its steps.
    pub fn task_visible_to(&self, task_id: Uuid, logins: &[String]) -> Result<bool> {
        let filter = TaskFilter {
            visible_to: Some(logins.to_vec()),
            ..Default::default()
        };
        let (clause, mut values) = filter.where_clause();
        values.push(Box::new(task_id.to_string()));
        let sql = format!(
            "SELECT COUNT(*) FROM tasks t WHERE {clause} AND t.id = ?{}",
            values.len()
        );
        let n: i64 = self.conn().query_row(
            &sql,
            params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let (clause, values) = filter.where_clause();
        let order = if filter.newest_first { "DESC" } else { "ASC" };
        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t WHERE {clause} ORDER BY t.started_at {order}, t.work_number {order}"
        );
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter().map(|v| v.as_ref())), row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_tasks(&self, filter: &TaskFilter) -> Result<i64> {
        let (clause, values) = filter.where_clause();
        let n = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM tasks t WHERE {clause}"),
            params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Distinct initiators of tasks matching the filter.
    pub fn task_initiators(&self, filter: &TaskFilter) -> Result<Vec<String>> {
        let (clause, values) = filter.where_clause();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT DISTINCT t.initiator FROM tasks t WHERE {clause} ORDER BY t.initiator"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter().map(|v| v.as_ref())), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    fn expect_task_row(&self, n: usize, id: Uuid) -> Result<()> {
        if n == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    /// Set the run status; terminal statuses stamp `finished_at`.
    pub fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE tasks SET status = ?3, last_changed_at = ?2,
                 finished_at = CASE WHEN ?4 = 1 THEN ?2 ELSE NULL END
             WHERE id = ?1",
            params![
                id.to_string(),
                fmt_dt(&Utc::now()),
                status.as_str(),
                status.is_terminal() as i64
            ],
        )?;
        self.expect_task_row(n, id)
    }

    pub fn update_task_human_status(&self, id: Uuid, status: HumanStatus, comment: &str) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE tasks SET human_status = ?3, human_status_comment = ?4, last_changed_at = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_dt(&Utc::now()), status.as_str(), comment],
        )?;
        self.expect_task_row(n, id)
    }

    pub fn set_task_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE tasks SET is_paused = ?3, last_changed_at = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_dt(&Utc::now()), paused as i64],
        )?;
        self.expect_task_row(n, id)
    }

    pub fn update_task_parameters(&self, id: Uuid, parameters: &Value) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE tasks SET parameters = ?3, last_changed_at = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_dt(&Utc::now()), serde_json::to_string(parameters)?],
        )?;
        self.expect_task_row(n, id)
    }

    /// Record `child` as the re-run of `parent`.
    pub fn link_parent_child(&self, parent: i64, child: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE tasks SET child_work_number = ?2 WHERE work_number = ?1",
            params![parent, child],
        )?;
        self.conn().execute(
            "UPDATE tasks SET parent_work_number = ?1 WHERE work_number = ?2",
            params![parent, child],
        )?;
        Ok(())
    }

    pub fn update_task_rate(&self, id: Uuid, rate: i32, comment: Option<&str>) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE tasks SET rate = ?3, rate_comment = ?4, last_changed_at = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_dt(&Utc::now()), rate, comment],
        )?;
        self.expect_task_row(n, id)
    }

    /// Tasks last changed before `before`, for retention sweeps.
    pub fn tasks_changed_before(&self, before: DateTime<Utc>, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let filter = TaskFilter {
            statuses: Some(statuses.to_vec()),
            ..Default::default()
        };
        let (clause, mut values) = filter.where_clause();
        values.push(Box::new(fmt_dt(&before)));
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t WHERE {clause} AND t.last_changed_at < ?{} ORDER BY t.work_number",
            values.len()
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter().map(|v| v.as_ref())), row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
