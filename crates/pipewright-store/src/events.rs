//! Task timeline: audit events, monitoring edits and pre-edit snapshots.

use pipewright_types::{EditRecord, EventType, PreviousContent, TaskEvent};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use crate::rows::{col_dt, col_json, col_parse, col_uuid, fmt_dt};
use crate::{Result, Tx};

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<TaskEvent> {
    Ok(TaskEvent {
        id: col_uuid(row, 0)?,
        task_id: col_uuid(row, 1)?,
        author: row.get(2)?,
        event_type: col_parse(row, 3)?,
        params: col_json(row, 4)?,
        created_at: col_dt(row, 5)?,
    })
}

fn row_to_edit(row: &Row<'_>) -> rusqlite::Result<EditRecord> {
    Ok(EditRecord {
        id: col_uuid(row, 0)?,
        event_id: col_uuid(row, 1)?,
        step_id: col_uuid(row, 2)?,
        step_name: row.get(3)?,
        author: row.get(4)?,
        change_type: col_parse(row, 5)?,
        content: col_json(row, 6)?,
        created_at: col_dt(row, 7)?,
    })
}

impl Tx<'_> {
    // ── Events ──────────────────────────────────────────────────────

    pub fn insert_event(&self, event: &TaskEvent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO task_events (id, task_id, author, event_type, params, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.task_id.to_string(),
                event.author,
                event.event_type.as_str(),
                serde_json::to_string(&event.params)?,
                fmt_dt(&event.created_at)
            ],
        )?;
        Ok(())
    }

    /// Events of a task, oldest first.
    pub fn list_events(&self, task_id: Uuid) -> Result<Vec<TaskEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, task_id, author, event_type, params, created_at FROM task_events
             WHERE task_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![task_id.to_string()], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn latest_event(&self, task_id: Uuid, event_type: EventType) -> Result<Option<TaskEvent>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, task_id, author, event_type, params, created_at FROM task_events
                 WHERE task_id = ?1 AND event_type = ?2 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![task_id.to_string(), event_type.as_str()],
                row_to_event,
            )
            .optional()?;
        Ok(row)
    }

    // ── Edit history ────────────────────────────────────────────────

    pub fn insert_edit(&self, task_id: Uuid, edit: &EditRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO edit_history (id, event_id, task_id, step_id, step_name, author, change_type, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                edit.id.to_string(),
                edit.event_id.to_string(),
                task_id.to_string(),
                edit.step_id.to_string(),
                edit.step_name,
                edit.author,
                edit.change_type.as_str(),
                serde_json::to_string(&edit.content)?,
                fmt_dt(&edit.created_at)
            ],
        )?;
        Ok(())
    }

    /// Edits of one block within a task, oldest first.
    pub fn list_edits(&self, task_id: Uuid, step_name: &str) -> Result<Vec<EditRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, event_id, step_id, step_name, author, change_type, content, created_at
             FROM edit_history WHERE task_id = ?1 AND step_name = ?2 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![task_id.to_string(), step_name], row_to_edit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Previous content ────────────────────────────────────────────

    pub fn insert_previous_content(&self, content: &PreviousContent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO previous_content (id, step_id, event_id, state, storage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                content.id.to_string(),
                content.step_id.to_string(),
                content.event_id.to_string(),
                serde_json::to_string(&content.state)?,
                serde_json::to_string(&content.storage)?,
                fmt_dt(&content.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn previous_content(&self, step_id: Uuid) -> Result<Vec<PreviousContent>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, step_id, event_id, state, storage, created_at FROM previous_content
             WHERE step_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![step_id.to_string()], |row| {
                Ok(PreviousContent {
                    id: col_uuid(row, 0)?,
                    step_id: col_uuid(row, 1)?,
                    event_id: col_uuid(row, 2)?,
                    state: col_json(row, 3)?,
                    storage: col_json(row, 4)?,
                    created_at: col_dt(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use crate::testing::{seed_task, step};
    use chrono::{Duration, Utc};
    use pipewright_types::{BlockKind, EditChangeType};
    use serde_json::json;

    #[test]
    fn test_events_and_edits() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| -> Result<()> {
                let task = seed_task(tx)?;
                let now = Utc::now();
                let pause = TaskEvent {
                    id: Uuid::new_v4(),
                    task_id: task,
                    author: "admin".into(),
                    event_type: EventType::Pause,
                    params: json!({"steps": []}),
                    created_at: now,
                };
                let start = TaskEvent {
                    event_type: EventType::Start,
                    id: Uuid::new_v4(),
                    created_at: now + Duration::seconds(1),
                    ..pause.clone()
                };
                tx.insert_event(&start)?;
                tx.insert_event(&pause)?;
                let events = tx.list_events(task)?;
                assert_eq!(events[0].event_type, EventType::Pause);
                assert_eq!(tx.latest_event(task, EventType::Start)?.unwrap().id, start.id);
                assert!(tx.latest_event(task, EventType::Edit)?.is_none());

                let s = step(task, "form_0", BlockKind::Form, now);
                tx.insert_step(&s)?;
                tx.insert_edit(
                    task,
                    &EditRecord {
                        id: Uuid::new_v4(),
                        event_id: pause.id,
                        step_id: s.id,
                        step_name: s.name.clone(),
                        author: "admin".into(),
                        change_type: EditChangeType::Output,
                        content: json!({"form_0.x": 2}),
                        created_at: now,
                    },
                )?;
                let edits = tx.list_edits(task, "form_0")?;
                assert_eq!(edits.len(), 1);
                assert_eq!(edits[0].content["form_0.x"], 2);

                tx.insert_previous_content(&PreviousContent {
                    id: Uuid::new_v4(),
                    step_id: s.id,
                    event_id: pause.id,
                    state: s.state.clone(),
                    storage: s.storage.clone(),
                    created_at: now,
                })?;
                assert_eq!(tx.previous_content(s.id)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
