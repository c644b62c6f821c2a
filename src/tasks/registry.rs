//! Point-in-time index of task state.
//!
//! The registry answers "what is the status of task X right now" for clients
//! that poll instead of subscribing. Only the broker writes to it, and it does
//! so inside the same critical section as the corresponding event append, so
//! a read issued after any broker call returns observes that call's effect.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::types::{
    StageRecord, StageStatus, StageUpdate, Task, TaskFailure, TaskSnapshot, TaskStatus,
};

#[derive(Debug, Clone)]
struct TaskRecord {
    task: Task,
    stages: Vec<StageRecord>,
    error: Option<TaskFailure>,
}

impl TaskRecord {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.task.id,
            status: self.task.status,
            template: self.task.spec.template_name().to_string(),
            values: self.task.spec.values.clone(),
            created_at: self.task.created_at,
            last_offset: self.task.last_offset,
            stages: self.stages.clone(),
            error: self.error.clone(),
        }
    }

    fn current_stage_mut(&mut self, name: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().rev().find(|s| s.name == name)
    }
}

/// Compact listing entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: Uuid,
    pub template: String,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<Utc>,
}

/// Counts of tasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub open: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RegistryStats {
    pub fn total(&self) -> usize {
        self.open + self.processing + self.completed + self.failed
    }
}

/// In-memory task index.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current view of a task.
    pub fn get(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        self.records
            .read()
            .expect("registry read lock poisoned")
            .get(&task_id)
            .map(TaskRecord::snapshot)
    }

    /// Returns the task record itself.
    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.records
            .read()
            .expect("registry read lock poisoned")
            .get(&task_id)
            .map(|r| r.task.clone())
    }

    /// Returns the current status of a task.
    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.records
            .read()
            .expect("registry read lock poisoned")
            .get(&task_id)
            .map(|r| r.task.status)
    }

    /// Lists all tasks, oldest first.
    pub fn list(&self) -> Vec<TaskSummary> {
        let records = self.records.read().expect("registry read lock poisoned");
        let mut summaries: Vec<TaskSummary> = records
            .values()
            .map(|r| TaskSummary {
                id: r.task.id,
                template: r.task.spec.template_name().to_string(),
                status: r.task.status,
                created_at: r.task.created_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn stats(&self) -> RegistryStats {
        let records = self.records.read().expect("registry read lock poisoned");
        let mut stats = RegistryStats::default();
        for record in records.values() {
            match record.task.status {
                TaskStatus::Open => stats.open += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("registry read lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&self, task: Task) {
        self.records
            .write()
            .expect("registry write lock poisoned")
            .insert(
                task.id,
                TaskRecord {
                    task,
                    stages: Vec::new(),
                    error: None,
                },
            );
    }

    /// Moves a task from `from` to `to`, returning the updated task.
    ///
    /// Returns `Err(current)` when the task is not in `from`, `Ok(None)` when
    /// it does not exist.
    pub(crate) fn transition(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<Option<Task>, TaskStatus> {
        let mut records = self.records.write().expect("registry write lock poisoned");
        let Some(record) = records.get_mut(&task_id) else {
            return Ok(None);
        };
        if record.task.status != from {
            return Err(record.task.status);
        }
        record.task.status = to;
        Ok(Some(record.task.clone()))
    }

    pub(crate) fn finish(&self, task_id: Uuid, status: TaskStatus, error: Option<TaskFailure>) {
        let mut records = self.records.write().expect("registry write lock poisoned");
        if let Some(record) = records.get_mut(&task_id) {
            record.task.status = status;
            record.error = error;
        }
    }

    pub(crate) fn set_offset(&self, task_id: Uuid, offset: u64) {
        let mut records = self.records.write().expect("registry write lock poisoned");
        if let Some(record) = records.get_mut(&task_id) {
            record.task.last_offset = record.task.last_offset.max(offset);
        }
    }

    pub(crate) fn touch_heartbeat(&self, task_id: Uuid) {
        let mut records = self.records.write().expect("registry write lock poisoned");
        if let Some(record) = records.get_mut(&task_id) {
            record.task.last_heartbeat_at = Some(Utc::now());
        }
    }

    pub(crate) fn append_stage_log(&self, task_id: Uuid, stage: &str, line: &str) {
        let mut records = self.records.write().expect("registry write lock poisoned");
        if let Some(stage) = records
            .get_mut(&task_id)
            .and_then(|r| r.current_stage_mut(stage))
        {
            stage.log.push(line.to_string());
        }
    }

    pub(crate) fn update_stage(&self, task_id: Uuid, name: &str, update: StageUpdate) {
        let mut records = self.records.write().expect("registry write lock poisoned");
        let Some(record) = records.get_mut(&task_id) else {
            return;
        };

        match update {
            StageUpdate::Started => record.stages.push(StageRecord::started(name)),
            StageUpdate::Completed { output } => {
                if let Some(stage) = record.current_stage_mut(name) {
                    stage.status = StageStatus::Completed;
                    stage.ended_at = Some(Utc::now());
                    stage.output = Some(output);
                }
            }
            StageUpdate::Failed => {
                if let Some(stage) = record.current_stage_mut(name) {
                    stage.status = StageStatus::Failed;
                    stage.ended_at = Some(Utc::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TemplateEntity;
    use crate::error::ErrorKind;
    use crate::tasks::TaskSpec;
    use serde_json::json;

    fn test_task() -> Task {
        let spec = TaskSpec::new(TemplateEntity::new("react-app", "tera"), json!({"owner": "me"}));
        Task::new(Uuid::new_v4(), spec)
    }

    #[test]
    fn test_insert_and_get() {
        let registry = TaskRegistry::new();
        let task = test_task();
        let id = task.id;
        registry.insert(task);

        let snapshot = registry.get(id).expect("task should be indexed");
        assert_eq!(snapshot.status, TaskStatus::Open);
        assert_eq!(snapshot.template, "react-app");
        assert!(snapshot.stages.is_empty());
        assert!(registry.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_transition_requires_expected_status() {
        let registry = TaskRegistry::new();
        let task = test_task();
        let id = task.id;
        registry.insert(task);

        let claimed = registry
            .transition(id, TaskStatus::Open, TaskStatus::Processing)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);

        let again = registry.transition(id, TaskStatus::Open, TaskStatus::Processing);
        assert_eq!(again.unwrap_err(), TaskStatus::Processing);

        assert!(registry
            .transition(Uuid::new_v4(), TaskStatus::Open, TaskStatus::Processing)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stage_records_in_order() {
        let registry = TaskRegistry::new();
        let task = test_task();
        let id = task.id;
        registry.insert(task);

        registry.update_stage(id, "prepare", StageUpdate::Started);
        registry.append_stage_log(id, "prepare", "copying skeleton");
        registry.update_stage(
            id,
            "prepare",
            StageUpdate::Completed {
                output: json!({"skeleton_dir": "/tmp/x"}),
            },
        );
        registry.update_stage(id, "template", StageUpdate::Started);
        registry.update_stage(id, "template", StageUpdate::Failed);
        registry.finish(
            id,
            TaskStatus::Failed,
            Some(TaskFailure::new(ErrorKind::StageExecution, "boom").with_stage("template")),
        );

        let snapshot = registry.get(id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        let names: Vec<&str> = snapshot.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["prepare", "template"]);

        let prepare = snapshot.stage("prepare").unwrap();
        assert_eq!(prepare.status, StageStatus::Completed);
        assert_eq!(prepare.log, vec!["copying skeleton".to_string()]);
        assert_eq!(prepare.output, Some(json!({"skeleton_dir": "/tmp/x"})));
        assert!(prepare.ended_at.is_some());

        assert_eq!(snapshot.stage("template").unwrap().status, StageStatus::Failed);
        assert_eq!(
            snapshot.error.unwrap().stage.as_deref(),
            Some("template")
        );
    }

    #[test]
    fn test_offset_watermark_is_monotonic() {
        let registry = TaskRegistry::new();
        let task = test_task();
        let id = task.id;
        registry.insert(task);

        registry.set_offset(id, 3);
        registry.set_offset(id, 2);
        assert_eq!(registry.get(id).unwrap().last_offset, 3);
    }

    #[test]
    fn test_stats_and_list() {
        let registry = TaskRegistry::new();
        let first = test_task();
        let second = test_task();
        let first_id = first.id;
        registry.insert(first);
        registry.insert(second);
        registry
            .transition(first_id, TaskStatus::Open, TaskStatus::Processing)
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total(), 2);
        assert_eq!(registry.list().len(), 2);
    }
}
