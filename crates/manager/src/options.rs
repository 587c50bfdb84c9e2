/// 读取任务时的附加信息选项
///
/// 集群状态需要查询其他节点，下次运行时间需要读取作业存储，
/// 两者可以分别选择。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskRetrieveOptions {
    /// 填充 `node_as_observed`
    pub include_cluster_status: bool,
    /// 允许使用缓存的集群状态
    pub allow_cached_status: bool,
    /// 填充 `next_run_start_time`
    pub include_next_run_time: bool,
}

impl TaskRetrieveOptions {
    pub fn with_cluster_status(mut self) -> Self {
        self.include_cluster_status = true;
        self
    }

    pub fn with_cached_status(mut self) -> Self {
        self.include_cluster_status = true;
        self.allow_cached_status = true;
        self
    }

    pub fn with_next_run_time(mut self) -> Self {
        self.include_next_run_time = true;
        self
    }

    pub fn is_plain(&self) -> bool {
        !self.include_cluster_status && !self.include_next_run_time
    }
}
