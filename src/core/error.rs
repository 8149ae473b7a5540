//! 任务错误类型
//!
//! 每类失败对应一个变体，错误消息面向模型可执行：告诉它该重新确认什么
//! （如「re-read the file」），而不是让它在猜测的状态上继续。

use thiserror::Error;

/// 任务解析与执行过程中可能出现的错误（解析、校验、路径逃逸、编辑安全等）
#[derive(Error, Debug)]
pub enum TaskError {
    /// 格式被识别但内容损坏（如 JSON 语法错误、无法识别的 type）；只中止本次解析
    #[error("Parse error: {0}")]
    Parse(String),

    /// 缺少必填字段或行号范围非法；在执行前拒绝该任务
    #[error("Validation error: {0}")]
    Validation(String),

    /// 解析后的路径逃出工作区根目录；任何文件系统调用之前检查
    #[error("Security error: path escapes workspace: {0}")]
    Security(String),

    /// 防截断启发式触发、SafeEdit 上下文不匹配、锚点未找到
    #[error("Edit safety error: {0}")]
    EditSafety(String),

    /// 写入失败或 patch 工具非零退出
    #[error("Apply error: {0}")]
    Apply(String),

    /// Shell 超时（与普通非零退出区分，明确是时间上限被触发）
    #[error("Shell command timed out after {0}s")]
    ShellTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// 错误分类名（审计日志与结果消息中的 status 字段用）
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Parse(_) => "parse",
            TaskError::Validation(_) => "validation",
            TaskError::Security(_) => "security",
            TaskError::EditSafety(_) => "edit_safety",
            TaskError::Apply(_) => "apply",
            TaskError::ShellTimeout(_) => "shell_timeout",
            TaskError::Io(_) => "io",
        }
    }
}
