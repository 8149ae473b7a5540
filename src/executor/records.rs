//! 记忆与待办协作者
//!
//! Memory / Todo 任务的增删改查属于外部协作者；这里只定义边界 trait，
//! 默认实现把记录追加到工作区下的 markdown 文件，足够让任务闭环。

use std::path::PathBuf;

use async_trait::async_trait;

use crate::core::TaskError;

/// 记忆记录协作者
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 追加一条记录，返回确认文本
    async fn append(&self, content: &str) -> Result<String, TaskError>;
}

/// 待办记录协作者
#[async_trait]
pub trait TodoStore: Send + Sync {
    async fn append(&self, content: &str) -> Result<String, TaskError>;
}

/// 默认记忆存储：<workspace>/.loom/memory.md
pub struct MarkdownMemoryStore {
    path: PathBuf,
}

impl MarkdownMemoryStore {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            path: workspace_root.into().join(".loom").join("memory.md"),
        }
    }
}

/// 默认待办存储：<workspace>/.loom/todos.md
pub struct MarkdownTodoStore {
    path: PathBuf,
}

impl MarkdownTodoStore {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            path: workspace_root.into().join(".loom").join("todos.md"),
        }
    }
}

fn append_line(path: &PathBuf, line: &str) -> Result<(), TaskError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TaskError::Apply(format!("failed to create record dir: {}", e)))?;
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| TaskError::Apply(format!("failed to open record file: {}", e)))?;
    writeln!(file, "{}", line)
        .map_err(|e| TaskError::Apply(format!("failed to append record: {}", e)))?;
    Ok(())
}

#[async_trait]
impl MemoryStore for MarkdownMemoryStore {
    async fn append(&self, content: &str) -> Result<String, TaskError> {
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        append_line(&self.path, &format!("- [{}] {}", stamp, content.trim()))?;
        Ok(format!("memory recorded: {}", content.trim()))
    }
}

#[async_trait]
impl TodoStore for MarkdownTodoStore {
    async fn append(&self, content: &str) -> Result<String, TaskError> {
        append_line(&self.path, &format!("- [ ] {}", content.trim()))?;
        Ok(format!("todo recorded: {}", content.trim()))
    }
}
