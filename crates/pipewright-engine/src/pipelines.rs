//! Pipeline and version management.
//!
//! Graphs arrive as raw JSON and are parsed and checked here before they
//! reach the store, so the HTTP layer never writes an unchecked graph.

use pipewright_store::{PipelineSummary, TaskFilter, Tx};
use pipewright_types::{
    ErrorKind, PipelineGraph, PipelineRecord, Task, VersionRecord, VersionSettings, VersionStatus,
};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::orchestrator::Engine;
use crate::registry::{parse_graph, validate_graph};
use crate::{EngineError, Result};

fn checked_graph(raw: &Value) -> Result<PipelineGraph> {
    let graph = parse_graph(raw)?;
    validate_graph(&graph)?;
    Ok(graph)
}

fn draft(tx: &Tx<'_>, version_id: Uuid) -> Result<VersionRecord> {
    let version = tx.get_version(version_id)?;
    if version.status != VersionStatus::Draft {
        return Err(EngineError::rejected(
            ErrorKind::VersionNotDraft,
            format!("version {version_id} is {}", version.status),
        ));
    }
    Ok(version)
}

impl Engine {
    /// Create a pipeline with its first draft version.
    pub fn create_pipeline(
        &self,
        name: &str,
        author: &str,
        graph: &Value,
    ) -> Result<(PipelineRecord, VersionRecord)> {
        if name.trim().is_empty() {
            return Err(EngineError::rejected(ErrorKind::Validation, "pipeline name is empty"));
        }
        let graph = checked_graph(graph)?;
        let created = self.store().transaction(|tx| -> Result<_> {
            let pipeline = tx.create_pipeline(name, author)?;
            let version = tx.create_version(pipeline.id, author, &graph, "")?;
            Ok((pipeline, version))
        })?;
        info!(pipeline_id = %created.0.id, name, author, "pipeline created");
        Ok(created)
    }

    pub fn list_pipelines(&self, search: Option<&str>) -> Result<Vec<PipelineSummary>> {
        self.store().read(|tx| -> Result<Vec<PipelineSummary>> {
            let all = tx.list_pipelines()?;
            Ok(match search.map(str::trim).filter(|s| !s.is_empty()) {
                Some(needle) => {
                    let hits: Vec<Uuid> =
                        tx.search_pipelines(needle)?.into_iter().map(|p| p.id).collect();
                    all.into_iter().filter(|s| hits.contains(&s.pipeline.id)).collect()
                }
                None => all,
            })
        })
    }

    pub fn get_pipeline(&self, id: Uuid) -> Result<(PipelineRecord, Vec<VersionRecord>)> {
        self.store().read(|tx| -> Result<_> {
            Ok((tx.get_pipeline(id)?, tx.list_versions(id)?))
        })
    }

    pub fn pipeline_name_exists(&self, name: &str) -> Result<bool> {
        Ok(self.store().read(|tx| tx.pipeline_name_exists(name))?)
    }

    pub fn rename_pipeline(&self, id: Uuid, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(EngineError::rejected(ErrorKind::Validation, "pipeline name is empty"));
        }
        self.store().transaction(|tx| tx.rename_pipeline(id, name))?;
        info!(pipeline_id = %id, name, "pipeline renamed");
        Ok(())
    }

    pub fn delete_pipeline(&self, id: Uuid) -> Result<()> {
        self.store().transaction(|tx| tx.delete_pipeline(id))?;
        info!(pipeline_id = %id, "pipeline deleted");
        Ok(())
    }

    /// Copy the newest version of a pipeline into a new pipeline as a draft.
    pub fn copy_pipeline(
        &self,
        id: Uuid,
        name: &str,
        author: &str,
    ) -> Result<(PipelineRecord, VersionRecord)> {
        let copied = self.store().transaction(|tx| -> Result<_> {
            let source = tx.latest_version(id, None)?.ok_or_else(|| {
                EngineError::rejected(ErrorKind::VersionNotFound, format!("pipeline {id} has no versions"))
            })?;
            let pipeline = tx.create_pipeline(name, author)?;
            let comment = format!("copied from {}", source.pipeline_name);
            let version = tx.create_version(pipeline.id, author, &source.graph, &comment)?;
            Ok((pipeline, version))
        })?;
        info!(from = %id, pipeline_id = %copied.0.id, name, "pipeline copied");
        Ok(copied)
    }

    pub fn create_version(
        &self,
        pipeline_id: Uuid,
        author: &str,
        graph: &Value,
        comment: &str,
    ) -> Result<VersionRecord> {
        let graph = checked_graph(graph)?;
        let version = self
            .store()
            .transaction(|tx| tx.create_version(pipeline_id, author, &graph, comment))?;
        info!(%pipeline_id, version_id = %version.id, "version created");
        Ok(version)
    }

    pub fn get_version(&self, id: Uuid) -> Result<VersionRecord> {
        Ok(self.store().read(|tx| tx.get_version(id))?)
    }

    /// Replace the graph of a draft.
    pub fn update_version(&self, id: Uuid, graph: &Value, comment: &str) -> Result<VersionRecord> {
        let graph = checked_graph(graph)?;
        self.store().transaction(|tx| -> Result<VersionRecord> {
            draft(tx, id)?;
            tx.update_version_graph(id, &graph, comment)?;
            Ok(tx.get_version(id)?)
        })
    }

    /// Approve a draft. Earlier approved versions of the pipeline are
    /// archived so exactly one version runs.
    pub fn approve_version(&self, id: Uuid, author: &str) -> Result<VersionRecord> {
        let version = self.store().transaction(|tx| -> Result<VersionRecord> {
            let version = draft(tx, id)?;
            validate_graph(&version.graph)?;
            for other in tx.list_versions(version.pipeline_id)? {
                if other.id != id && other.status == VersionStatus::Approved {
                    tx.set_version_status(other.id, VersionStatus::Archived)?;
                }
            }
            tx.set_version_status(id, VersionStatus::Approved)?;
            Ok(tx.get_version(id)?)
        })?;
        info!(version_id = %id, author, "version approved");
        Ok(version)
    }

    pub fn reject_version(&self, id: Uuid, author: &str) -> Result<VersionRecord> {
        let version = self.store().transaction(|tx| -> Result<VersionRecord> {
            draft(tx, id)?;
            tx.set_version_status(id, VersionStatus::Rejected)?;
            Ok(tx.get_version(id)?)
        })?;
        info!(version_id = %id, author, "version rejected");
        Ok(version)
    }

    /// Settings of a version; a version never configured gets defaults.
    pub fn version_settings(&self, version_id: Uuid) -> Result<VersionSettings> {
        self.store().read(|tx| -> Result<VersionSettings> {
            tx.get_version(version_id)?;
            match tx.get_version_settings(version_id) {
                Ok(settings) => Ok(settings),
                Err(pipewright_store::StoreError::NotFound { .. }) => Ok(VersionSettings {
                    version_id,
                    sla: 0.0,
                    work_type: "8/5".into(),
                    extra: Value::Null,
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn put_version_settings(&self, settings: &VersionSettings) -> Result<()> {
        if settings.work_type.parse::<pipewright_sla::WorkType>().is_err() {
            return Err(EngineError::rejected(
                ErrorKind::Validation,
                format!("unknown work type {:?}", settings.work_type),
            ));
        }
        self.store().transaction(|tx| -> Result<()> {
            tx.get_version(settings.version_id)?;
            tx.put_version_settings(settings)?;
            Ok(())
        })
    }

    /// Tasks matching `filter`, restricted to what `login` may see.
    pub async fn list_tasks(&self, login: &str, mut filter: TaskFilter) -> Result<(Vec<Task>, i64)> {
        let delegations = self.delegations_for(login).await?;
        filter.visible_to = Some(delegations.with_delegators(&[login.to_string()]));
        self.store().read(|tx| -> Result<_> {
            Ok((tx.list_tasks(&filter)?, tx.count_tasks(&filter)?))
        })
    }

    pub async fn count_tasks(&self, login: &str, mut filter: TaskFilter) -> Result<i64> {
        let delegations = self.delegations_for(login).await?;
        filter.visible_to = Some(delegations.with_delegators(&[login.to_string()]));
        filter.limit = None;
        filter.offset = None;
        Ok(self.store().read(|tx| tx.count_tasks(&filter))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pipewright_store::Store;
    use serde_json::json;

    use crate::services::Services;

    fn engine() -> Engine {
        Engine::new(Arc::new(Store::open_in_memory().unwrap()), Services::basic())
    }

    fn graph() -> Value {
        json!({
            "entrypoint": "start_0",
            "blocks": {
                "start_0": {"kind": "start", "sockets": [{"id": "default", "next": ["end_0"]}]},
                "end_0": {"kind": "end"}
            }
        })
    }

    #[test]
    fn test_unknown_kind_is_named() {
        let raw = json!({"entrypoint": "x", "blocks": {"x": {"kind": "teleport"}}});
        let err = engine().create_pipeline("p", "a", &raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownBlockKind);
    }

    #[test]
    fn test_approve_archives_previous() {
        let engine = engine();
        let (pipeline, first) = engine.create_pipeline("p", "a", &graph()).unwrap();
        engine.approve_version(first.id, "a").unwrap();
        let second = engine.create_version(pipeline.id, "a", &graph(), "v2").unwrap();
        engine.approve_version(second.id, "a").unwrap();

        assert_eq!(engine.get_version(first.id).unwrap().status, VersionStatus::Archived);
        let err = engine.reject_version(second.id, "a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionNotDraft);
    }

    #[test]
    fn test_copy_and_name_checks() {
        let engine = engine();
        let (pipeline, _) = engine.create_pipeline("payroll", "a", &graph()).unwrap();
        assert!(engine.pipeline_name_exists("payroll").unwrap());
        let err = engine.copy_pipeline(pipeline.id, "payroll", "a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PipelineNameUsed);

        let (copy, version) = engine.copy_pipeline(pipeline.id, "payroll 2", "b").unwrap();
        assert_eq!(version.status, VersionStatus::Draft);
        assert_eq!(engine.list_pipelines(Some("ROLL 2")).unwrap()[0].pipeline.id, copy.id);
        assert_eq!(engine.list_pipelines(None).unwrap().len(), 2);
    }

    #[test]
    fn test_settings_default_then_stored() {
        let engine = engine();
        let (_, version) = engine.create_pipeline("p", "a", &graph()).unwrap();
        assert_eq!(engine.version_settings(version.id).unwrap().work_type, "8/5");

        let mut settings = engine.version_settings(version.id).unwrap();
        settings.work_type = "always".into();
        assert!(engine.put_version_settings(&settings).is_err());
        settings.work_type = "24/7".into();
        settings.sla = 16.0;
        engine.put_version_settings(&settings).unwrap();
        assert_eq!(engine.version_settings(version.id).unwrap().sla, 16.0);
    }
}
