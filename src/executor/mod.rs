//! 任务执行器
//!
//! 对 Task 枚举做穷尽分发：读取 / 编辑 / 列目录 / Shell / 搜索 / 记忆 / 待办。
//! 所有路径先过沙箱解析再碰文件系统；每次执行输出结构化审计日志（JSON）。
//! execute 不返回 Err——失败被转成 success=false 的 TaskResponse，并带上
//! 告诉模型如何恢复的提示。

pub mod edit;
pub mod list;
pub mod read;
pub mod records;
pub mod redact;
pub mod search;
pub mod shell;
pub mod workspace;

use std::sync::Arc;
use std::time::Instant;

pub use list::{DefaultIgnore, IgnoreMatcher};
pub use records::{MarkdownMemoryStore, MarkdownTodoStore, MemoryStore, TodoStore};
pub use search::{GrepSearch, SearchProvider};
pub use workspace::Workspace;

use crate::config::ToolsSection;
use crate::core::TaskError;
use crate::patch::{self, PatchEngine, SystemPatchEngine};
use crate::task::{EditStrategy, EditSummary, Task, TaskResponse};

use redact::SecretRedactor;

/// 任务执行器：沙箱工作区 + 各协作者
pub struct Executor {
    workspace: Workspace,
    tools: ToolsSection,
    redactor: SecretRedactor,
    ignore: Arc<dyn IgnoreMatcher>,
    search: Arc<dyn SearchProvider>,
    memory: Arc<dyn MemoryStore>,
    todos: Arc<dyn TodoStore>,
    patch_engine: Arc<dyn PatchEngine>,
}

impl Executor {
    pub fn new(workspace: Workspace, tools: ToolsSection) -> Self {
        let root = workspace.root().to_path_buf();
        let ignore = Arc::new(DefaultIgnore::new(&tools.list.ignore_globs));
        let search = Arc::new(GrepSearch::new(tools.search.clone()));
        let patch_engine = Arc::new(SystemPatchEngine::new(tools.subprocess_timeout_secs));
        Self {
            workspace,
            tools,
            redactor: SecretRedactor::new(),
            ignore,
            search,
            memory: Arc::new(MarkdownMemoryStore::new(root.clone())),
            todos: Arc::new(MarkdownTodoStore::new(root)),
            patch_engine,
        }
    }

    pub fn with_patch_engine(mut self, engine: Arc<dyn PatchEngine>) -> Self {
        self.patch_engine = engine;
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = search;
        self
    }

    pub fn with_ignore(mut self, ignore: Arc<dyn IgnoreMatcher>) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// 执行单个任务；失败转为 success=false 的响应，不向上抛错
    pub async fn execute(&self, task: Task) -> TaskResponse {
        let start = Instant::now();
        let type_name = task.type_name();
        let arg_preview = preview(task.key_arg());

        let result = self.dispatch(&task).await;

        let (ok, outcome) = match &result {
            Ok(resp) if resp.success => (true, "ok"),
            Ok(_) => (false, "failed"),
            Err(e) => (false, e.kind()),
        };
        let audit = serde_json::json!({
            "event": "task_audit",
            "task": type_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "arg_preview": arg_preview,
        });
        tracing::info!(audit = %audit.to_string(), "task");

        match result {
            Ok(resp) => resp,
            Err(e) => failure_response(task, e),
        }
    }

    async fn dispatch(&self, task: &Task) -> Result<TaskResponse, TaskError> {
        match task {
            Task::ReadFile {
                path,
                start_line,
                end_line,
            } => self.read_file(task, path, *start_line, *end_line),
            Task::EditFile { path, .. } => self.edit_file(task, path).await,
            Task::ListDir { path } => self.list_dir(task, path),
            Task::RunShell {
                command,
                timeout_secs,
                path,
            } => {
                self.run_shell(task, command, *timeout_secs, path.as_deref())
                    .await
            }
            Task::Search { query, path } => self.search_text(task, query, path.as_deref()).await,
            Task::Memory { content } => {
                let line = self.memory.append(content).await?;
                Ok(TaskResponse::success(task.clone(), format!("✓ {}", line)))
            }
            Task::Todo { content } => {
                let line = self.todos.append(content).await?;
                Ok(TaskResponse::success(task.clone(), format!("✓ {}", line)))
            }
        }
    }

    fn read_file(
        &self,
        task: &Task,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<TaskResponse, TaskError> {
        let resolved = self.workspace.resolve(path)?;
        if !resolved.exists() {
            return Err(TaskError::Apply(format!("file not found: '{}'", path)));
        }
        let display = self.workspace.display_path(&resolved);
        let result = read::read_window(
            &resolved,
            &display,
            &self.tools.read,
            &self.redactor,
            start_line,
            end_line,
        )?;
        let note = if result.truncated { " (truncated)" } else { "" };
        Ok(TaskResponse::success(
            task.clone(),
            format!(
                "✓ Read {} lines {}-{} of {}{}",
                display, result.window.0, result.window.1, result.total_lines, note
            ),
        )
        .with_content(result.content))
    }

    fn list_dir(&self, task: &Task, path: &str) -> Result<TaskResponse, TaskError> {
        let listing = list::list_dir(
            &self.workspace,
            &self.tools.list,
            self.ignore.as_ref(),
            path,
        )?;
        let count = listing.lines().count();
        Ok(
            TaskResponse::success(task.clone(), format!("✓ Listed {} ({} entries)", path, count))
                .with_content(listing),
        )
    }

    async fn run_shell(
        &self,
        task: &Task,
        command: &str,
        timeout_secs: Option<u64>,
        cwd: Option<&str>,
    ) -> Result<TaskResponse, TaskError> {
        let timeout = timeout_secs.unwrap_or(self.tools.shell.timeout_secs);
        let output =
            shell::run_shell(&self.workspace, &self.tools.shell, command, timeout, cwd).await?;

        let mut content = String::new();
        if !output.stdout.is_empty() {
            content.push_str("stdout:\n");
            content.push_str(&output.stdout);
        }
        if !output.stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("stderr:\n");
            content.push_str(&output.stderr);
        }

        if output.success() {
            Ok(
                TaskResponse::success(task.clone(), format!("✓ Command exited 0: {}", command))
                    .with_content(content),
            )
        } else {
            // 非零退出没有部分成功可言
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Ok(
                TaskResponse::failure(task.clone(), format!("command exited {}: {}", code, command))
                    .with_content(content),
            )
        }
    }

    async fn search_text(
        &self,
        task: &Task,
        query: &str,
        sub_path: Option<&str>,
    ) -> Result<TaskResponse, TaskError> {
        if let Some(p) = sub_path {
            // 子目录同样过沙箱
            self.workspace.resolve(p)?;
        }
        let hits = self
            .search
            .search(self.workspace.root(), query, sub_path)
            .await?;
        let formatted = search::format_hits(&hits, self.tools.search.max_results);
        Ok(TaskResponse::success(
            task.clone(),
            format!("✓ Search '{}': {} matches", query, hits.len()),
        )
        .with_content(formatted))
    }

    async fn edit_file(&self, task: &Task, path: &str) -> Result<TaskResponse, TaskError> {
        let resolved = self.workspace.resolve(path)?;
        let display = self.workspace.display_path(&resolved);

        if task.edit_strategy() == Some(EditStrategy::DiffBlock) {
            return self.apply_diff_block(task).await;
        }

        let file_exists = resolved.is_file();
        let current = if file_exists {
            let metadata = std::fs::metadata(&resolved)
                .map_err(|e| TaskError::Apply(format!("cannot stat '{}': {}", display, e)))?;
            if metadata.len() > self.tools.edit.max_file_bytes {
                return Err(TaskError::Validation(format!(
                    "'{}' is too large to edit: {} bytes (max {})",
                    display,
                    metadata.len(),
                    self.tools.edit.max_file_bytes
                )));
            }
            self.workspace.read_to_string(&resolved)?
        } else {
            String::new()
        };

        // prepare：算出新内容与预览；apply：真正写盘。当前策略 prepare 成功即刻 apply
        let prepared = edit::prepare_edit(&display, &current, file_exists, task)?;

        if prepared.summary.is_identical_content {
            return Ok(TaskResponse::success(
                task.clone(),
                format!("✓ {} already matches; no change needed", display),
            )
            .with_summary(prepared.summary));
        }

        self.workspace.write(
            &resolved,
            &prepared.new_content,
            self.tools.edit.backup_enabled && file_exists,
        )?;

        let action = if file_exists { "Edited" } else { "Created" };
        Ok(TaskResponse::success(
            task.clone(),
            format!(
                "✓ {} {} (+{} -{} ~{} lines)",
                action,
                display,
                prepared.summary.lines_added,
                prepared.summary.lines_removed,
                prepared.summary.lines_modified
            ),
        )
        .with_content(prepared.preview)
        .with_summary(prepared.summary))
    }

    /// diff-block 载荷：整体交给 patch 子系统，经外部 patch 工具应用
    async fn apply_diff_block(&self, task: &Task) -> Result<TaskResponse, TaskError> {
        let Task::EditFile {
            diff_block: Some(raw),
            ..
        } = task
        else {
            return Err(TaskError::Validation(
                "diff_block payload is missing".to_string(),
            ));
        };
        let block = patch::validate_block(raw)?;
        let resolved = self.workspace.resolve(&block.dest_path)?;
        let display = self.workspace.display_path(&resolved);

        let before = if resolved.is_file() {
            self.workspace.read_to_string(&resolved)?
        } else {
            String::new()
        };

        let tool_output = self
            .patch_engine
            .apply(self.workspace.root(), &block)
            .await?;

        let after = if resolved.is_file() {
            self.workspace.read_to_string(&resolved)?
        } else {
            String::new()
        };
        let summary = EditSummary::compute(&before, &after);

        Ok(TaskResponse::success(
            task.clone(),
            format!(
                "✓ Applied diff block to {} (+{} -{} ~{} lines)",
                display, summary.lines_added, summary.lines_removed, summary.lines_modified
            ),
        )
        .with_content(tool_output)
        .with_summary(summary))
    }
}

/// 把错误折叠进响应，并补充模型可执行的恢复提示
fn failure_response(task: Task, error: TaskError) -> TaskResponse {
    let hint = match &error {
        TaskError::EditSafety(_) => {
            Some("re-read the file to refresh your view of its current content, then retry")
        }
        TaskError::Security(_) => Some("paths must stay inside the workspace root"),
        TaskError::ShellTimeout(_) => {
            Some("the command exceeded its time budget; narrow it or raise timeout_secs")
        }
        TaskError::Apply(_) => Some("verify the file state before retrying"),
        _ => None,
    };
    let response = TaskResponse::failure(task, error.to_string());
    match hint {
        Some(h) => response.with_contextual_error(h),
        None => response,
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 120 {
        let cut: String = text.chars().take(120).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(dir: &std::path::Path) -> Executor {
        Executor::new(Workspace::new(dir), ToolsSection::default())
    }

    fn full_content_edit(path: &str, content: &str) -> Task {
        Task::EditFile {
            path: path.to_string(),
            diff: None,
            diff_block: None,
            content: Some(content.to_string()),
            start_context: None,
            end_context: None,
            insert_mode: None,
            new_text: None,
            before_context: None,
            after_context: None,
            target_line: None,
            target_start_line: None,
            target_end_line: None,
        }
    }

    #[tokio::test]
    async fn test_sandbox_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        for task in [
            Task::ReadFile {
                path: "../outside.txt".into(),
                start_line: None,
                end_line: None,
            },
            full_content_edit("../outside.txt", "x"),
            Task::ListDir {
                path: "../outside".into(),
            },
        ] {
            let resp = exec.execute(task).await;
            assert!(!resp.success);
            assert!(resp.error.as_deref().unwrap_or("").contains("workspace"));
        }
        // 沙箱外不应出现任何文件
        assert!(!dir.path().parent().unwrap().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn test_full_replacement_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let content = "fn main() {}\n";

        let first = exec.execute(full_content_edit("src/main.rs", content)).await;
        assert!(first.success);
        assert!(!first.edit_summary.as_ref().unwrap().is_identical_content);

        let modified = std::fs::metadata(dir.path().join("src/main.rs"))
            .unwrap()
            .modified()
            .unwrap();

        let second = exec.execute(full_content_edit("src/main.rs", content)).await;
        assert!(second.success);
        assert!(second.edit_summary.as_ref().unwrap().is_identical_content);
        // 第二次不触盘
        assert_eq!(
            std::fs::metadata(dir.path().join("src/main.rs"))
                .unwrap()
                .modified()
                .unwrap(),
            modified
        );
    }

    #[tokio::test]
    async fn test_truncated_replacement_fails_and_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let original: String = (1..=20).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(dir.path().join("f.txt"), &original).unwrap();

        let short: String = (1..=5).map(|i| format!("line {}\n", i)).collect();
        let resp = exec.execute(full_content_edit("f.txt", &short)).await;
        assert!(!resp.success);
        assert!(resp.contextual_error.is_some());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            original
        );
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let resp = exec
            .execute(Task::ReadFile {
                path: "nope.txt".into(),
                start_line: None,
                end_line: None,
            })
            .await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn test_memory_and_todo_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let m = exec
            .execute(Task::Memory {
                content: "likes short names".into(),
            })
            .await;
        assert!(m.success);
        let t = exec
            .execute(Task::Todo {
                content: "wire up CI".into(),
            })
            .await;
        assert!(t.success);
        assert!(dir.path().join(".loom/memory.md").exists());
        assert!(dir.path().join(".loom/todos.md").exists());
    }
}
