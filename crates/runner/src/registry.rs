use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use taskhub_domain::entities::StepKind;
use taskhub_errors::{HubError, HubResult};

use crate::executors::{HttpExecutor, PythonExecutor, ShellExecutor, SqlExecutor, StepExecutor};

/// 步骤类型到执行器的映射
///
/// 未注册的类型在执行阶段报错，按普通步骤失败处理，不影响其余步骤的
/// 依赖与跳过逻辑。
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// 注册内置的四种执行器
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellExecutor::new()));
        registry.register(Arc::new(PythonExecutor::new()));
        registry.register(Arc::new(SqlExecutor::new()));
        registry.register(Arc::new(HttpExecutor::new()));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: StepKind) -> HubResult<Arc<dyn StepExecutor>> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| HubError::execution_error(format!("未注册的步骤类型: {kind}")))
    }

    /// 向所有执行器转发取消请求
    pub async fn cancel_step(&self, run_id: i64, step_id: i64) {
        for executor in self.executors.values() {
            if let Err(e) = executor.cancel(run_id, step_id).await {
                warn!(
                    "取消步骤失败: run={} step={} kind={} error={}",
                    run_id,
                    step_id,
                    executor.kind(),
                    e
                );
            }
        }
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_builtin_kinds() {
        let registry = ExecutorRegistry::with_defaults();
        for kind in [StepKind::Shell, StepKind::Python, StepKind::Sql, StepKind::Http] {
            assert!(registry.get(kind).is_ok());
        }
    }

    #[test]
    fn test_unregistered_kind_is_error() {
        let registry = ExecutorRegistry::with_defaults();
        let err = registry.get(StepKind::Email).unwrap_err();
        assert!(err.to_string().contains("未注册"));
    }
}
