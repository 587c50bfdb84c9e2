use chrono::{DateTime, Utc};

use crate::state::TaskExecutionStatus;
use crate::task::Task;

/// 任务查询条件，各条件之间为"与"关系
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub oids: Option<Vec<String>>,
    pub execution_statuses: Option<Vec<TaskExecutionStatus>>,
    pub parent: Option<String>,
    pub root_only: bool,
    pub category: Option<String>,
    pub handler_uri: Option<String>,
    pub name_contains: Option<String>,
    /// 由该节点正在运行的任务
    pub executing_node: Option<String>,
    pub completed_before: Option<DateTime<Utc>>,
    pub depends_on: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_oids<I, S>(oids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            oids: Some(oids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn children_of(parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[TaskExecutionStatus]) -> Self {
        self.execution_statuses = Some(statuses.to_vec());
        self
    }

    pub fn roots(mut self) -> Self {
        self.root_only = true;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_handler_uri(mut self, uri: impl Into<String>) -> Self {
        self.handler_uri = Some(uri.into());
        self
    }

    pub fn with_name_containing(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    pub fn executing_on(mut self, node_id: impl Into<String>) -> Self {
        self.executing_node = Some(node_id.into());
        self
    }

    pub fn completed_before(mut self, at: DateTime<Utc>) -> Self {
        self.completed_before = Some(at);
        self
    }

    pub fn depending_on(mut self, oid: impl Into<String>) -> Self {
        self.depends_on = Some(oid.into());
        self
    }

    pub fn paged(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(oids) = &self.oids {
            if !task.oid.as_ref().is_some_and(|oid| oids.contains(oid)) {
                return false;
            }
        }

        if let Some(statuses) = &self.execution_statuses {
            if !statuses.contains(&task.execution_status) {
                return false;
            }
        }

        if self.parent.is_some() && task.parent != self.parent {
            return false;
        }

        if self.root_only && !task.is_root() {
            return false;
        }

        if self.category.is_some() && task.category != self.category {
            return false;
        }

        if self.handler_uri.is_some() && task.handler_uri != self.handler_uri {
            return false;
        }

        if let Some(fragment) = &self.name_contains {
            if !task.name.contains(fragment.as_str()) {
                return false;
            }
        }

        if let Some(node) = &self.executing_node {
            if task.execution_status != TaskExecutionStatus::Running
                || task.node.as_ref() != Some(node)
            {
                return false;
            }
        }

        if let Some(before) = self.completed_before {
            if !task.completion_timestamp.is_some_and(|ts| ts < before) {
                return false;
            }
        }

        if let Some(dep) = &self.depends_on {
            if !task.depends_on.contains(dep) {
                return false;
            }
        }

        true
    }

    /// 对已排序的结果应用分页
    pub fn paginate(&self, tasks: Vec<Task>) -> Vec<Task> {
        let iter = tasks.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}
