//! 任务数据模型
//!
//! Task 是带标签的枚举（serde tag = "type"），由 Parser 一次性产出、Executor
//! 恰好消费一次；不复用、不原地修改，重试意味着模型在下一轮发出全新任务。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 编辑插入模式（上下文锚点编辑用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    Append,
    InsertBefore,
    InsertAfter,
    Replace,
    /// 字面量全局替换，忽略行锚点
    ReplaceAll,
    InsertBetween,
}

/// 模型请求的单个操作
///
/// EditFile 的四种载荷形状互斥：引擎按字段存在性、以固定优先级选择其一
/// （见 [`Task::edit_strategy`]），解析校验保证至少有一种存在。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Task {
    ReadFile {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_line: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_line: Option<usize>,
    },
    EditFile {
        path: String,
        /// 原始 unified diff 文本（优先级 1）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        /// 不透明 diff-block 载荷，整体交给 patch 子系统（优先级 2）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff_block: Option<String>,
        /// 全文替换内容（优先级 3）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// 锚点编辑：定位锚文本（优先级 4）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insert_mode: Option<InsertMode>,
        /// 锚点编辑要写入的新文本
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_text: Option<String>,
        /// SafeEdit：目标行紧前方必须出现的上下文
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_context: Option<String>,
        /// SafeEdit：目标行紧后方必须出现的上下文
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_line: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_start_line: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_end_line: Option<usize>,
    },
    ListDir {
        /// 缺省为工作区根目录
        #[serde(default = "default_list_path")]
        path: String,
    },
    RunShell {
        command: String,
        /// 缺省由校验阶段填入配置默认值
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        /// 可选工作目录（工作区相对）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Search {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Memory {
        content: String,
    },
    Todo {
        content: String,
    },
}

fn default_list_path() -> String {
    ".".to_string()
}

/// EditFile 的活跃策略（按固定优先级从字段存在性推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStrategy {
    UnifiedDiff,
    DiffBlock,
    FullContent,
    Anchored,
}

impl Task {
    /// 变体名（审计日志与去重键用）
    pub fn type_name(&self) -> &'static str {
        match self {
            Task::ReadFile { .. } => "ReadFile",
            Task::EditFile { .. } => "EditFile",
            Task::ListDir { .. } => "ListDir",
            Task::RunShell { .. } => "RunShell",
            Task::Search { .. } => "Search",
            Task::Memory { .. } => "Memory",
            Task::Todo { .. } => "Todo",
        }
    }

    /// 路径/查询参数（去重键的第二分量）
    pub fn key_arg(&self) -> &str {
        match self {
            Task::ReadFile { path, .. } => path,
            Task::EditFile { path, .. } => path,
            Task::ListDir { path } => path,
            Task::RunShell { command, .. } => command,
            Task::Search { query, .. } => query,
            Task::Memory { content } => content,
            Task::Todo { content } => content,
        }
    }

    /// EditFile 的活跃策略；非 EditFile 或无任何载荷时为 None
    pub fn edit_strategy(&self) -> Option<EditStrategy> {
        let Task::EditFile {
            diff,
            diff_block,
            content,
            start_context,
            insert_mode,
            new_text,
            before_context,
            after_context,
            target_line,
            target_start_line,
            ..
        } = self
        else {
            return None;
        };
        if diff.is_some() {
            Some(EditStrategy::UnifiedDiff)
        } else if diff_block.is_some() {
            Some(EditStrategy::DiffBlock)
        } else if content.is_some() {
            Some(EditStrategy::FullContent)
        } else if start_context.is_some()
            || insert_mode.is_some()
            || new_text.is_some()
            || before_context.is_some()
            || after_context.is_some()
            || target_line.is_some()
            || target_start_line.is_some()
        {
            Some(EditStrategy::Anchored)
        } else {
            None
        }
    }
}

/// 单个任务的执行结果；构造后不可变
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    pub task: Task,
    pub success: bool,
    /// 面向用户的一行状态
    pub output: String,
    /// 面向模型的内容（文件内容、diff 预览等），可以不展示给用户
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_summary: Option<EditSummary>,
    /// 告诉模型如何恢复的补充信息（如「re-read the file」）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contextual_error: Option<String>,
}

impl TaskResponse {
    pub fn success(task: Task, output: impl Into<String>) -> Self {
        Self {
            task,
            success: true,
            output: output.into(),
            actual_content: None,
            error: None,
            edit_summary: None,
            contextual_error: None,
        }
    }

    pub fn failure(task: Task, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            task,
            success: false,
            output: format!("Failed: {}", error),
            actual_content: None,
            error: Some(error),
            edit_summary: None,
            contextual_error: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.actual_content = Some(content.into());
        self
    }

    pub fn with_summary(mut self, summary: EditSummary) -> Self {
        self.edit_summary = Some(summary);
        self
    }

    pub fn with_contextual_error(mut self, hint: impl Into<String>) -> Self {
        self.contextual_error = Some(hint.into());
        self
    }
}

/// 编辑前后对比统计；纯函数产物，计算后不再修改
#[derive(Debug, Clone, Serialize)]
pub struct EditSummary {
    pub lines_before: usize,
    pub lines_after: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub lines_modified: usize,
    pub is_identical_content: bool,
}

impl EditSummary {
    /// 由 (旧内容, 新内容) 计算；行级 diff 使用 similar
    pub fn compute(old: &str, new: &str) -> Self {
        use similar::{DiffOp, TextDiff};

        let mut added = 0usize;
        let mut removed = 0usize;
        let mut modified = 0usize;
        let diff = TextDiff::from_lines(old, new);
        for op in diff.ops() {
            match op {
                DiffOp::Insert { new_len, .. } => added += new_len,
                DiffOp::Delete { old_len, .. } => removed += old_len,
                DiffOp::Replace {
                    old_len, new_len, ..
                } => {
                    let common = (*old_len).min(*new_len);
                    modified += common;
                    added += new_len - common;
                    removed += old_len - common;
                }
                DiffOp::Equal { .. } => {}
            }
        }

        Self {
            lines_before: old.lines().count(),
            lines_after: new.lines().count(),
            bytes_before: old.len(),
            bytes_after: new.len(),
            lines_added: added,
            lines_removed: removed,
            lines_modified: modified,
            is_identical_content: old == new,
        }
    }
}

/// 一轮消息内的执行记录：tasks 与 responses 按下标一一对应
///
/// 终态只有 "completed"（本轮所有任务均已尝试）；单个任务的失败
/// 只体现在 responses[i].success 上。
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    pub id: String,
    pub tasks: Vec<Task>,
    pub responses: Vec<TaskResponse>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
}

impl TaskExecution {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tasks,
            responses: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            status: "running".to_string(),
        }
    }

    pub fn record(&mut self, response: TaskResponse) {
        self.responses.push(response);
    }

    /// 批次结束：标记 completed 并落终止时间
    pub fn close(&mut self) {
        self.finished_at = Some(Utc::now());
        self.status = "completed".to_string();
    }
}
