//! Pipelines, versions and version settings.

use chrono::Utc;
use pipewright_types::{PipelineGraph, PipelineRecord, VersionRecord, VersionSettings, VersionStatus};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use crate::rows::{col_dt, col_json, col_parse, col_uuid, fmt_dt};
use crate::{Result, StoreError, Tx};

const VERSION_COLUMNS: &str = "v.id, v.pipeline_id, p.name, v.status, v.author, v.comment, v.graph, v.created_at";

fn row_to_pipeline(row: &Row<'_>) -> rusqlite::Result<PipelineRecord> {
    Ok(PipelineRecord {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        author: row.get(2)?,
        created_at: col_dt(row, 3)?,
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
    Ok(VersionRecord {
        id: col_uuid(row, 0)?,
        pipeline_id: col_uuid(row, 1)?,
        pipeline_name: row.get(2)?,
        status: col_parse(row, 3)?,
        author: row.get(4)?,
        comment: row.get(5)?,
        graph: col_json(row, 6)?,
        created_at: col_dt(row, 7)?,
    })
}

/// A pipeline with its newest version.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub pipeline: PipelineRecord,
    pub latest_version: Option<VersionRecord>,
}

impl Tx<'_> {
    // ── Pipelines ───────────────────────────────────────────────────

    pub fn pipeline_name_exists(&self, name: &str) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM pipelines WHERE name = ?1 AND deleted_at IS NULL",
            params![name],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn create_pipeline(&self, name: &str, author: &str) -> Result<PipelineRecord> {
        if self.pipeline_name_exists(name)? {
            return Err(StoreError::NameUsed(name.to_string()));
        }
        let record = PipelineRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            author: author.to_string(),
            created_at: Utc::now(),
        };
        self.conn().execute(
            "INSERT INTO pipelines (id, name, author, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                record.name,
                record.author,
                fmt_dt(&record.created_at)
            ],
        )?;
        Ok(record)
    }

    pub fn get_pipeline(&self, id: Uuid) -> Result<PipelineRecord> {
        self.conn()
            .query_row(
                "SELECT id, name, author, created_at FROM pipelines WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string()],
                row_to_pipeline,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("pipeline", id))
    }

    pub fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, author, created_at FROM pipelines
             WHERE deleted_at IS NULL ORDER BY created_at DESC",
        )?;
        let pipelines = stmt
            .query_map([], row_to_pipeline)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        pipelines
            .into_iter()
            .map(|pipeline| {
                let latest_version = self.latest_version(pipeline.id, None)?;
                Ok(PipelineSummary {
                    pipeline,
                    latest_version,
                })
            })
            .collect()
    }

    /// Pipelines whose name contains `needle`, case-insensitively.
    pub fn search_pipelines(&self, needle: &str) -> Result<Vec<PipelineRecord>> {
        let pattern = format!("%{}%", needle.to_lowercase());
        let mut stmt = self.conn().prepare(
            "SELECT id, name, author, created_at FROM pipelines
             WHERE deleted_at IS NULL AND lower(name) LIKE ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![pattern], row_to_pipeline)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn rename_pipeline(&self, id: Uuid, name: &str) -> Result<()> {
        if self.pipeline_name_exists(name)? {
            return Err(StoreError::NameUsed(name.to_string()));
        }
        let n = self.conn().execute(
            "UPDATE pipelines SET name = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), name],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("pipeline", id));
        }
        Ok(())
    }

    /// Soft delete; existing tasks keep their versions.
    pub fn delete_pipeline(&self, id: Uuid) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE pipelines SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), fmt_dt(&Utc::now())],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("pipeline", id));
        }
        Ok(())
    }

    // ── Versions ────────────────────────────────────────────────────

    pub fn create_version(
        &self,
        pipeline_id: Uuid,
        author: &str,
        graph: &PipelineGraph,
        comment: &str,
    ) -> Result<VersionRecord> {
        let pipeline = self.get_pipeline(pipeline_id)?;
        let record = VersionRecord {
            id: Uuid::new_v4(),
            pipeline_id,
            pipeline_name: pipeline.name,
            status: VersionStatus::Draft,
            author: author.to_string(),
            comment: comment.to_string(),
            graph: graph.clone(),
            created_at: Utc::now(),
        };
        self.conn().execute(
            "INSERT INTO versions (id, pipeline_id, status, author, comment, graph, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                pipeline_id.to_string(),
                record.status.as_str(),
                record.author,
                record.comment,
                serde_json::to_string(graph)?,
                fmt_dt(&record.created_at)
            ],
        )?;
        self.put_version_settings(&VersionSettings {
            version_id: record.id,
            sla: 0.0,
            work_type: "8/5".to_string(),
            extra: serde_json::Value::Null,
        })?;
        Ok(record)
    }

    pub fn get_version(&self, id: Uuid) -> Result<VersionRecord> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions v JOIN pipelines p ON p.id = v.pipeline_id
                     WHERE v.id = ?1"
                ),
                params![id.to_string()],
                row_to_version,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("version", id))
    }

    pub fn list_versions(&self, pipeline_id: Uuid) -> Result<Vec<VersionRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions v JOIN pipelines p ON p.id = v.pipeline_id
             WHERE v.pipeline_id = ?1 ORDER BY v.created_at DESC"
        ))?;
        let rows = stmt
            .query_map(params![pipeline_id.to_string()], row_to_version)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Newest version of a pipeline, optionally restricted to a status.
    pub fn latest_version(
        &self,
        pipeline_id: Uuid,
        status: Option<VersionStatus>,
    ) -> Result<Option<VersionRecord>> {
        let status = status.map(|s| s.as_str().to_string());
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions v JOIN pipelines p ON p.id = v.pipeline_id
                     WHERE v.pipeline_id = ?1 AND (?2 IS NULL OR v.status = ?2)
                     ORDER BY v.created_at DESC LIMIT 1"
                ),
                params![pipeline_id.to_string(), status],
                row_to_version,
            )
            .optional()?;
        Ok(row)
    }

    /// Replace the graph of a draft version.
    pub fn update_version_graph(&self, id: Uuid, graph: &PipelineGraph, comment: &str) -> Result<()> {
        let current = self.get_version(id)?;
        if current.status != VersionStatus::Draft {
            return Err(StoreError::Conflict(format!("version {id} is not a draft")));
        }
        self.conn().execute(
            "UPDATE versions SET graph = ?2, comment = ?3 WHERE id = ?1",
            params![id.to_string(), serde_json::to_string(graph)?, comment],
        )?;
        Ok(())
    }

    pub fn set_version_status(&self, id: Uuid, status: VersionStatus) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE versions SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::not_found("version", id));
        }
        Ok(())
    }

    // ── Settings ────────────────────────────────────────────────────

    pub fn put_version_settings(&self, settings: &VersionSettings) -> Result<()> {
        self.conn().execute(
            "INSERT INTO version_settings (version_id, sla, work_type, extra) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(version_id) DO UPDATE SET sla = ?2, work_type = ?3, extra = ?4",
            params![
                settings.version_id.to_string(),
                f64::from(settings.sla),
                settings.work_type,
                serde_json::to_string(&settings.extra)?
            ],
        )?;
        Ok(())
    }

    pub fn get_version_settings(&self, version_id: Uuid) -> Result<VersionSettings> {
        self.conn()
            .query_row(
                "SELECT version_id, sla, work_type, extra FROM version_settings WHERE version_id = ?1",
                params![version_id.to_string()],
                |row| {
                    Ok(VersionSettings {
                        version_id: col_uuid(row, 0)?,
                        sla: row.get::<_, f64>(1)? as f32,
                        work_type: row.get(2)?,
                        extra: col_json(row, 3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("version settings", version_id))
    }
}
