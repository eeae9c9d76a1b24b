//! Steps, their members and their SLA deadlines.

use chrono::{DateTime, Utc};
use pipewright_types::{BlockKind, Member, Step, StepStatus, UpdateAction};
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use crate::rows::{col_bool, col_dt, col_json, col_parse, col_uuid, fmt_dt};
use crate::{Result, StoreError, Tx};

const STEP_COLUMNS: &str = "id, task_id, name, kind, time, updated_at, status, has_error, is_paused, \
     state, storage, visited, errors, stop_points";

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: col_uuid(row, 0)?,
        task_id: col_uuid(row, 1)?,
        name: row.get(2)?,
        kind: col_parse(row, 3)?,
        time: col_dt(row, 4)?,
        updated_at: col_dt(row, 5)?,
        status: col_parse(row, 6)?,
        has_error: col_bool(row, 7)?,
        is_paused: col_bool(row, 8)?,
        state: col_json(row, 9)?,
        storage: col_json(row, 10)?,
        steps: col_json(row, 11)?,
        errors: col_json(row, 12)?,
        stop_points: col_json(row, 13)?,
    })
}

/// A pending SLA notification for a step.
#[derive(Debug, Clone, PartialEq)]
pub struct DueDeadline {
    pub id: i64,
    pub step_id: Uuid,
    pub task_id: Uuid,
    pub action: UpdateAction,
    pub deadline: DateTime<Utc>,
}

impl Tx<'_> {
    // ── Steps ───────────────────────────────────────────────────────

    pub fn insert_step(&self, step: &Step) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO steps ({STEP_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                step.id.to_string(),
                step.task_id.to_string(),
                step.name,
                step.kind.as_str(),
                fmt_dt(&step.time),
                fmt_dt(&step.updated_at),
                step.status.as_str(),
                step.has_error as i64,
                step.is_paused as i64,
                serde_json::to_string(&step.state)?,
                serde_json::to_string(&step.storage)?,
                serde_json::to_string(&step.steps)?,
                serde_json::to_string(&step.errors)?,
                serde_json::to_string(&step.stop_points)?
            ],
        )?;
        Ok(())
    }

    /// Overwrite the mutable content of a step.
    pub fn update_step(&self, step: &Step) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE steps SET updated_at = ?2, status = ?3, has_error = ?4, is_paused = ?5,
                 state = ?6, storage = ?7, visited = ?8, errors = ?9, stop_points = ?10
             WHERE id = ?1",
            params![
                step.id.to_string(),
                fmt_dt(&step.updated_at),
                step.status.as_str(),
                step.has_error as i64,
                step.is_paused as i64,
                serde_json::to_string(&step.state)?,
                serde_json::to_string(&step.storage)?,
                serde_json::to_string(&step.steps)?,
                serde_json::to_string(&step.errors)?,
                serde_json::to_string(&step.stop_points)?
            ],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("step", step.id));
        }
        Ok(())
    }

    pub fn get_step(&self, id: Uuid) -> Result<Step> {
        self.conn()
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
                params![id.to_string()],
                row_to_step,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("step", id))
    }

    /// Every step of a task ordered by `(time, id)`.
    pub fn list_steps(&self, task_id: Uuid) -> Result<Vec<Step>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE task_id = ?1 ORDER BY time, id"
        ))?;
        let rows = stmt
            .query_map(params![task_id.to_string()], row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn latest_step(&self, task_id: Uuid) -> Result<Option<Step>> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps WHERE task_id = ?1 ORDER BY time DESC, id DESC LIMIT 1"
                ),
                params![task_id.to_string()],
                row_to_step,
            )
            .optional()?;
        Ok(row)
    }

    pub fn latest_step_by_name(&self, task_id: Uuid, name: &str) -> Result<Option<Step>> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps WHERE task_id = ?1 AND name = ?2
                     ORDER BY time DESC, id DESC LIMIT 1"
                ),
                params![task_id.to_string(), name],
                row_to_step,
            )
            .optional()?;
        Ok(row)
    }

    /// Latest step named `name` that is not newer than `at`.
    pub fn step_by_name_as_of(&self, task_id: Uuid, name: &str, at: DateTime<Utc>) -> Result<Option<Step>> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps WHERE task_id = ?1 AND name = ?2 AND time <= ?3
                     ORDER BY time DESC, id DESC LIMIT 1"
                ),
                params![task_id.to_string(), name, fmt_dt(&at)],
                row_to_step,
            )
            .optional()?;
        Ok(row)
    }

    /// Idle or running steps of the given kinds, oldest first.
    pub fn unfinished_steps(&self, task_id: Uuid, kinds: &[BlockKind]) -> Result<Vec<Step>> {
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(task_id.to_string())];
        let mut slots = Vec::new();
        for kind in kinds {
            values.push(Box::new(kind.as_str()));
            slots.push(format!("?{}", values.len()));
        }
        if slots.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps
             WHERE task_id = ?1 AND status IN ('idle', 'running') AND kind IN ({})
             ORDER BY time, id",
            slots.join(", ")
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter().map(|v| v.as_ref())), row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Steps strictly newer than `after`.
    pub fn steps_after(&self, task_id: Uuid, after: DateTime<Utc>) -> Result<Vec<Step>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE task_id = ?1 AND time > ?2 ORDER BY time, id"
        ))?;
        let rows = stmt
            .query_map(params![task_id.to_string(), fmt_dt(&after)], row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_step_status(&self, id: Uuid, status: StepStatus) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE steps SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), fmt_dt(&Utc::now())],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("step", id));
        }
        Ok(())
    }

    /// Cancel every idle or running step of a task. Returns how many changed.
    pub fn stop_open_steps(&self, task_id: Uuid) -> Result<usize> {
        let n = self.conn().execute(
            "UPDATE steps SET status = 'canceled', updated_at = ?2
             WHERE task_id = ?1 AND status IN ('idle', 'running')",
            params![task_id.to_string(), fmt_dt(&Utc::now())],
        )?;
        Ok(n)
    }

    /// Pause or unpause steps; `names = None` means every open step.
    pub fn set_steps_paused(&self, task_id: Uuid, names: Option<&[String]>, paused: bool) -> Result<usize> {
        let now = fmt_dt(&Utc::now());
        let n = match names {
            None => self.conn().execute(
                "UPDATE steps SET is_paused = ?2, updated_at = ?3
                 WHERE task_id = ?1 AND status IN ('idle', 'running')",
                params![task_id.to_string(), paused as i64, now],
            )?,
            Some(names) => {
                let mut total = 0;
                for name in names {
                    total += self.conn().execute(
                        "UPDATE steps SET is_paused = ?2, updated_at = ?3
                         WHERE task_id = ?1 AND name = ?4 AND status IN ('idle', 'running')",
                        params![task_id.to_string(), paused as i64, now, name],
                    )?;
                }
                total
            }
        };
        Ok(n)
    }

    // ── Members ─────────────────────────────────────────────────────

    pub fn replace_step_members(&self, step_id: Uuid, members: &[Member]) -> Result<()> {
        self.conn().execute(
            "DELETE FROM step_members WHERE step_id = ?1",
            params![step_id.to_string()],
        )?;
        for m in members {
            self.conn().execute(
                "INSERT OR REPLACE INTO step_members (step_id, login, is_acted) VALUES (?1, ?2, ?3)",
                params![step_id.to_string(), m.login, m.is_acted as i64],
            )?;
        }
        Ok(())
    }

    pub fn step_members(&self, step_id: Uuid) -> Result<Vec<Member>> {
        let mut stmt = self.conn().prepare(
            "SELECT login, is_acted FROM step_members WHERE step_id = ?1 ORDER BY login",
        )?;
        let rows = stmt
            .query_map(params![step_id.to_string()], |row| {
                Ok(Member {
                    login: row.get(0)?,
                    is_acted: col_bool(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Deadlines ───────────────────────────────────────────────────

    /// Replace the pending deadlines of a step.
    pub fn replace_deadlines(&self, step: &Step, deadlines: &[(UpdateAction, DateTime<Utc>)]) -> Result<()> {
        self.conn().execute(
            "DELETE FROM deadlines WHERE step_id = ?1 AND processed = 0",
            params![step.id.to_string()],
        )?;
        for (action, at) in deadlines {
            self.conn().execute(
                "INSERT INTO deadlines (step_id, task_id, action, deadline) VALUES (?1, ?2, ?3, ?4)",
                params![
                    step.id.to_string(),
                    step.task_id.to_string(),
                    action.as_str(),
                    fmt_dt(at)
                ],
            )?;
        }
        Ok(())
    }

    pub fn clear_deadlines(&self, step_id: Uuid) -> Result<()> {
        self.conn().execute(
            "DELETE FROM deadlines WHERE step_id = ?1 AND processed = 0",
            params![step_id.to_string()],
        )?;
        Ok(())
    }

    /// Unprocessed deadlines at or before `now`, earliest first.
    pub fn due_deadlines(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DueDeadline>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, step_id, task_id, action, deadline FROM deadlines
             WHERE processed = 0 AND deadline <= ?1 ORDER BY deadline, id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![fmt_dt(&now), limit], |row| {
                Ok(DueDeadline {
                    id: row.get(0)?,
                    step_id: col_uuid(row, 1)?,
                    task_id: col_uuid(row, 2)?,
                    action: col_parse(row, 3)?,
                    deadline: col_dt(row, 4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn pending_deadlines(&self, step_id: Uuid) -> Result<Vec<(UpdateAction, DateTime<Utc>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT action, deadline FROM deadlines WHERE step_id = ?1 AND processed = 0 ORDER BY deadline",
        )?;
        let rows = stmt
            .query_map(params![step_id.to_string()], |row| {
                Ok((col_parse(row, 0)?, col_dt(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_deadline_processed(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE deadlines SET processed = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use crate::testing::{seed_task, step};
    use chrono::Duration;

    fn test_store() -> Store {
        Store::open_in_memory().expect("failed to open in-memory store")
    }

    #[test]
    fn test_steps_order_by_time_then_id() {
        let store = test_store();
        store
            .transaction(|tx| -> Result<()> {
                let task = seed_task(tx)?;
                let t0 = Utc::now();
                let a = step(task, "start_0", BlockKind::Start, t0);
                let b = step(task, "approver_0", BlockKind::Approver, t0 + Duration::milliseconds(5));
                let c = step(task, "approver_0", BlockKind::Approver, t0 + Duration::milliseconds(9));
                tx.insert_step(&c)?;
                tx.insert_step(&a)?;
                tx.insert_step(&b)?;
                let names: Vec<Uuid> = tx.list_steps(task)?.into_iter().map(|s| s.id).collect();
                assert_eq!(names, vec![a.id, b.id, c.id]);
                assert_eq!(tx.latest_step(task)?.unwrap().id, c.id);
                assert_eq!(tx.latest_step_by_name(task, "approver_0")?.unwrap().id, c.id);
                assert_eq!(
                    tx.step_by_name_as_of(task, "approver_0", t0 + Duration::milliseconds(6))?
                        .unwrap()
                        .id,
                    b.id
                );
                assert_eq!(tx.steps_after(task, b.time)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_update_and_unfinished() {
        let store = test_store();
        store
            .transaction(|tx| -> Result<()> {
                let task = seed_task(tx)?;
                let mut s = step(task, "approver_0", BlockKind::Approver, Utc::now());
                s.status = StepStatus::Running;
                tx.insert_step(&s)?;
                assert_eq!(tx.unfinished_steps(task, &[BlockKind::Approver])?.len(), 1);
                assert!(tx.unfinished_steps(task, &[BlockKind::Execution])?.is_empty());

                s.status = StepStatus::Finished;
                s.storage.insert("approver_0.decision".into(), "approve".into());
                s.errors.push("x".into());
                tx.update_step(&s)?;
                let loaded = tx.get_step(s.id)?;
                assert_eq!(loaded.status, StepStatus::Finished);
                assert_eq!(loaded.storage["approver_0.decision"], "approve");
                assert_eq!(loaded.errors, vec!["x"]);
                assert!(tx.unfinished_steps(task, &[BlockKind::Approver])?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_pause_and_stop() {
        let store = test_store();
        store
            .transaction(|tx| -> Result<()> {
                let task = seed_task(tx)?;
                let mut s = step(task, "execution_0", BlockKind::Execution, Utc::now());
                s.status = StepStatus::Idle;
                tx.insert_step(&s)?;
                assert_eq!(tx.set_steps_paused(task, Some(&["execution_0".to_string()]), true)?, 1);
                assert!(tx.get_step(s.id)?.is_paused);
                assert_eq!(tx.stop_open_steps(task)?, 1);
                assert_eq!(tx.get_step(s.id)?.status, StepStatus::Canceled);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_members_and_deadlines() {
        let store = test_store();
        store
            .transaction(|tx| -> Result<()> {
                let task = seed_task(tx)?;
                let s = step(task, "approver_0", BlockKind::Approver, Utc::now());
                tx.insert_step(&s)?;
                tx.replace_step_members(s.id,&[Member::new("u1"), Member::new("u2")])?;
                assert_eq!(tx.step_members(s.id)?.len(), 2);
                assert!(tx.task_visible_to(task, &["u2".into()])?);

                let now = Utc::now();
                tx.replace_deadlines(
                    &s,
                    &[
                        (UpdateAction::HalfSlaBreach, now - Duration::hours(1)),
                        (UpdateAction::SlaBreach, now + Duration::hours(1)),
                    ],
                )?;
                let due = tx.due_deadlines(now, 10)?;
                assert_eq!(due.len(), 1);
                assert_eq!(due[0].action, UpdateAction::HalfSlaBreach);
                tx.mark_deadline_processed(due[0].id)?;
                assert!(tx.due_deadlines(now, 10)?.is_empty());
                assert_eq!(tx.pending_deadlines(s.id)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
