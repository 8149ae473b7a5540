//! 轮次过程事件：供 SSE / TUI 等前端展示任务进度

use serde::Serialize;

/// 单轮处理中的过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 目标漂移：消息改写了先前声明的目标，本轮不执行任何任务
    ObjectiveDrift {
        original: String,
        detected: String,
    },
    /// 任务开始执行
    TaskStarted {
        index: usize,
        total: usize,
        task_type: String,
        arg: String,
    },
    /// 任务成功结束
    TaskCompleted { index: usize, output: String },
    /// 任务失败（批次继续）
    TaskFailed { index: usize, error: String },
    /// 整批结束
    TurnCompleted {
        execution_id: String,
        total: usize,
        failed: usize,
    },
}
