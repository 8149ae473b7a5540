//! 多级任务解析器
//!
//! 按优先级短路的解析链：diff 块 -> 自然语言指令 -> 围栏 JSON -> 裸 JSON。
//! 各级之间无共享可变状态；某级产出至少一个任务即停止下探。产出要么是
//! 完整校验过的任务表，要么什么都没有——绝不返回部分结果。解析出零个任务
//! 不是错误，代表这只是一条普通回复。

pub mod classify;
pub mod directive;
pub mod json_task;

use crate::core::TaskError;
use crate::patch;
use crate::task::{InsertMode, Task};

/// 任务解析器：无状态链 + 校验阶段的默认值来源
pub struct Parser {
    default_shell_timeout_secs: u64,
}

impl Parser {
    pub fn new(default_shell_timeout_secs: u64) -> Self {
        Self {
            default_shell_timeout_secs,
        }
    }

    /// 解析一条模型消息
    ///
    /// Ok(None) = 普通回复；Ok(Some) = 完整校验过的任务表；
    /// Err = 被识别但损坏的输入（JSON 语法错误、缺字段等）。
    pub fn parse(&self, text: &str) -> Result<Option<Vec<Task>>, TaskError> {
        // 第一级：diff 块。载荷不在这里解析，只打标签整体下传
        let blocks = patch::parse_blocks(text)?;
        if !blocks.is_empty() {
            let mut tasks: Vec<Task> = blocks
                .into_iter()
                .map(|b| Task::EditFile {
                    path: b.dest_path,
                    diff: None,
                    diff_block: Some(b.raw),
                    content: None,
                    start_context: None,
                    end_context: None,
                    insert_mode: None,
                    new_text: None,
                    before_context: None,
                    after_context: None,
                    target_line: None,
                    target_start_line: None,
                    target_end_line: None,
                })
                .collect();
            self.validate(&mut tasks)?;
            return Ok(Some(tasks));
        }

        // 第二级：自然语言指令
        let mut tasks = directive::parse_directives(text);
        if !tasks.is_empty() {
            self.validate(&mut tasks)?;
            return Ok(Some(tasks));
        }

        // 第三级：围栏 JSON
        let mut tasks = json_task::parse_fenced_json(text)?;
        if !tasks.is_empty() {
            self.validate(&mut tasks)?;
            return Ok(Some(tasks));
        }

        // 第四级：裸 JSON 回退
        let mut tasks = json_task::parse_bare_json(text)?;
        if !tasks.is_empty() {
            self.validate(&mut tasks)?;
            return Ok(Some(tasks));
        }

        Ok(None)
    }

    /// 类型相关的必填字段校验；缺失即中止整个解析并指明字段
    fn validate(&self, tasks: &mut [Task]) -> Result<(), TaskError> {
        for task in tasks.iter_mut() {
            match task {
                Task::ReadFile {
                    path,
                    start_line,
                    end_line,
                } => {
                    if path.trim().is_empty() {
                        return Err(TaskError::Validation(
                            "ReadFile task is missing 'path'".to_string(),
                        ));
                    }
                    validate_range(*start_line, *end_line)?;
                }
                Task::EditFile { .. } => validate_edit(task)?,
                Task::ListDir { path } => {
                    if path.trim().is_empty() {
                        *path = ".".to_string();
                    }
                }
                Task::RunShell {
                    command,
                    timeout_secs,
                    ..
                } => {
                    if command.trim().is_empty() {
                        return Err(TaskError::Validation(
                            "RunShell task is missing 'command'".to_string(),
                        ));
                    }
                    if timeout_secs.is_none() {
                        *timeout_secs = Some(self.default_shell_timeout_secs);
                    }
                }
                Task::Search { query, .. } => {
                    if query.trim().is_empty() {
                        return Err(TaskError::Validation(
                            "Search task is missing 'query'".to_string(),
                        ));
                    }
                }
                Task::Memory { content } => {
                    if content.trim().is_empty() {
                        return Err(TaskError::Validation(
                            "Memory task is missing 'content'".to_string(),
                        ));
                    }
                }
                Task::Todo { content } => {
                    if content.trim().is_empty() {
                        return Err(TaskError::Validation(
                            "Todo task is missing 'content'".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_range(start: Option<usize>, end: Option<usize>) -> Result<(), TaskError> {
    if let Some(s) = start {
        if s == 0 {
            return Err(TaskError::Validation(
                "line numbers are 1-based; 'start_line' must be >= 1".to_string(),
            ));
        }
        if let Some(e) = end {
            if e < s {
                return Err(TaskError::Validation(format!(
                    "invalid line range: end_line {} is before start_line {}",
                    e, s
                )));
            }
        }
    } else if end.is_some() {
        return Err(TaskError::Validation(
            "'end_line' given without 'start_line'".to_string(),
        ));
    }
    Ok(())
}

fn validate_edit(task: &Task) -> Result<(), TaskError> {
    let Task::EditFile {
        path,
        start_context,
        end_context,
        insert_mode,
        new_text,
        before_context,
        after_context,
        target_line,
        target_start_line,
        target_end_line,
        ..
    } = task
    else {
        return Ok(());
    };

    if path.trim().is_empty() {
        return Err(TaskError::Validation(
            "EditFile task is missing 'path'".to_string(),
        ));
    }
    let Some(strategy) = task.edit_strategy() else {
        return Err(TaskError::Validation(format!(
            "EditFile task for '{}' is missing an edit payload \
             ('diff', 'diff_block', 'content', or anchored-edit fields)",
            path
        )));
    };

    if strategy != crate::task::EditStrategy::Anchored {
        return Ok(());
    }

    // 锚点/SafeEdit 编辑都必须带新文本
    if new_text.is_none() {
        return Err(TaskError::Validation(format!(
            "anchored edit for '{}' is missing 'new_text'",
            path
        )));
    }

    let safe_edit = before_context.is_some() || after_context.is_some();
    if safe_edit {
        if before_context.is_none() || after_context.is_none() {
            return Err(TaskError::Validation(format!(
                "safe edit for '{}' requires both 'before_context' and 'after_context'",
                path
            )));
        }
        let has_single = target_line.is_some();
        let has_range = target_start_line.is_some() && target_end_line.is_some();
        if !has_single && !has_range {
            return Err(TaskError::Validation(format!(
                "safe edit for '{}' requires 'target_line' or \
                 'target_start_line'/'target_end_line'",
                path
            )));
        }
        if let (Some(s), Some(e)) = (target_start_line, target_end_line) {
            if *s == 0 || e < s {
                return Err(TaskError::Validation(format!(
                    "safe edit for '{}' has an invalid target line range {}-{}",
                    path, s, e
                )));
            }
        }
        return Ok(());
    }

    // 普通锚点编辑：行号目标或 insert_mode + 锚文本
    if target_start_line.is_some() || target_line.is_some() {
        return Ok(());
    }
    let Some(mode) = insert_mode else {
        return Err(TaskError::Validation(format!(
            "anchored edit for '{}' is missing 'insert_mode'",
            path
        )));
    };
    match mode {
        InsertMode::Append => Ok(()),
        InsertMode::InsertBetween => {
            if start_context.is_none() || end_context.is_none() {
                Err(TaskError::Validation(format!(
                    "insert_between edit for '{}' requires both 'start_context' and 'end_context'",
                    path
                )))
            } else {
                Ok(())
            }
        }
        _ => {
            if start_context.is_none() {
                Err(TaskError::Validation(format!(
                    "{:?} edit for '{}' is missing 'start_context'",
                    mode, path
                )))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> Parser {
        Parser::new(30)
    }

    #[test]
    fn test_plain_reply_is_none() {
        let result = parser().parse("Sure, the bug is in the loop condition.").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_diff_block_beats_fenced_json() {
        let text = format!(
            "{}\n--- a/src/a.rs\n+++ b/src/a.rs\n@@ -1 +1 @@\n-x\n+y\n{}\n\
             ```json\n{{\"type\": \"ReadFile\", \"path\": \"src/a.rs\"}}\n```\n",
            patch::BLOCK_START,
            patch::BLOCK_END
        );
        let tasks = parser().parse(&text).unwrap().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(
            tasks[0].edit_strategy(),
            Some(crate::task::EditStrategy::DiffBlock)
        ));
    }

    #[test]
    fn test_directives_beat_json() {
        let text = "READ src/main.rs\n```json\n{\"type\": \"ListDir\", \"path\": \"src\"}\n```\n";
        let tasks = parser().parse(text).unwrap().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].type_name(), "ReadFile");
    }

    #[test]
    fn test_run_shell_gets_default_timeout() {
        let tasks = parser().parse("RUN cargo check\n").unwrap().unwrap();
        match &tasks[0] {
            Task::RunShell { timeout_secs, .. } => assert_eq!(*timeout_secs, Some(30)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_edit_without_payload_aborts_parse() {
        let err = parser()
            .parse("EDIT src/lib.rs -> make it faster\n")
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn test_invalid_read_range_aborts_parse() {
        let err = parser().parse("READ src/main.rs:40-10\n").unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[test]
    fn test_fenced_json_task_list() {
        let text = "```json\n{\"tasks\": [{\"type\": \"ListDir\", \"path\": \"\"}]}\n```\n";
        let tasks = parser().parse(text).unwrap().unwrap();
        match &tasks[0] {
            Task::ListDir { path } => assert_eq!(path, "."),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
