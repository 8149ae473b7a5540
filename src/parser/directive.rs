//! 自然语言指令解析（解析链第二级）
//!
//! 识别 `VERB path[:line[-line]] [(options)]` 与 `VERB path -> description`
//! 形式的指令行；EDIT 指令的载荷取紧随其后的围栏代码块，否则取后续被判定为
//! 「结构化」的裸行。同一 `(type, path)` 每轮只保留第一个，后续重复静默丢弃。

use std::collections::HashSet;

use regex::Regex;

use crate::parser::classify::{is_conversational_line, is_structured_payload};
use crate::task::{InsertMode, Task};

const VERBS: &[&str] = &["READ", "EDIT", "LIST", "RUN", "SEARCH", "MEMORY", "TODO"];

struct Directive {
    verb: String,
    /// 动词之后的整行参数（未裁剪 -> 与括号）
    rest: String,
    /// 指令行行号
    line_idx: usize,
}

/// 解析消息中的全部自然语言指令；无指令时返回空表
pub fn parse_directives(text: &str) -> Vec<Task> {
    let lines: Vec<&str> = text.lines().collect();
    let directives = collect_directive_lines(&lines);

    let mut tasks: Vec<Task> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for directive in &directives {
        let Some(task) = build_task(directive, &lines) else {
            continue;
        };
        let key = (task.type_name().to_string(), task.key_arg().to_string());
        if seen.contains(&key) {
            // 重复指令：first match wins
            continue;
        }
        seen.insert(key);
        tasks.push(task);
    }
    tasks
}

/// 收集指令行（跳过围栏块内部与叙述句）
fn collect_directive_lines(lines: &[&str]) -> Vec<Directive> {
    let mut out = Vec::new();
    let mut in_fence = false;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if is_conversational_line(line) {
            continue;
        }
        let Some((verb, rest)) = split_verb(trimmed) else {
            continue;
        };
        out.push(Directive {
            verb: verb.to_string(),
            rest: rest.to_string(),
            line_idx: idx,
        });
    }
    out
}

fn split_verb(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let first = parts.next()?;
    if !VERBS.contains(&first) {
        return None;
    }
    Some((first, parts.next().unwrap_or("").trim()))
}

/// 去掉 `-> description` 与尾部 `(options)` 修饰，留下纯参数
fn strip_decorations(rest: &str) -> String {
    let arg = rest.split("->").next().unwrap_or("").trim();
    let arg = match (arg.rfind('('), arg.ends_with(')')) {
        (Some(open), true) => arg[..open].trim(),
        _ => arg,
    };
    arg.to_string()
}

fn path_range_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<path>.+?)(?::(?P<start>\d+)(?:-(?P<end>\d+))?)?$").expect("path regex")
    })
}

/// 拆 `path[:line[-line]]`
fn split_path_range(arg: &str) -> (String, Option<usize>, Option<usize>) {
    let Some(caps) = path_range_regex().captures(arg) else {
        return (arg.to_string(), None, None);
    };
    let path = caps.name("path").map(|m| m.as_str()).unwrap_or(arg);
    let start = caps.name("start").and_then(|m| m.as_str().parse().ok());
    let end = caps.name("end").and_then(|m| m.as_str().parse().ok());
    (path.to_string(), start, end)
}

fn build_task(directive: &Directive, lines: &[&str]) -> Option<Task> {
    match directive.verb.as_str() {
        "READ" => {
            let arg = strip_decorations(&directive.rest);
            if arg.is_empty() {
                return None;
            }
            let (path, start, end) = split_path_range(&arg);
            Some(Task::ReadFile {
                path,
                start_line: start,
                end_line: end,
            })
        }
        "LIST" => {
            let arg = strip_decorations(&directive.rest);
            Some(Task::ListDir {
                path: if arg.is_empty() { ".".to_string() } else { arg },
            })
        }
        "RUN" => {
            // 命令原样保留：括号与箭头可能是 shell 语法的一部分
            let command = directive.rest.trim();
            if command.is_empty() {
                return None;
            }
            Some(Task::RunShell {
                command: command.to_string(),
                timeout_secs: None,
                path: None,
            })
        }
        "SEARCH" => {
            let query = strip_decorations(&directive.rest);
            if query.is_empty() {
                return None;
            }
            Some(Task::Search { query, path: None })
        }
        "MEMORY" => {
            let content = directive.rest.trim();
            if content.is_empty() {
                return None;
            }
            Some(Task::Memory {
                content: content.to_string(),
            })
        }
        "TODO" => {
            let content = directive.rest.trim();
            if content.is_empty() {
                return None;
            }
            Some(Task::Todo {
                content: content.to_string(),
            })
        }
        "EDIT" => build_edit_task(directive, lines),
        _ => None,
    }
}

/// EDIT 指令：路径来自指令行，载荷来自其后的围栏块或结构化裸行
fn build_edit_task(directive: &Directive, lines: &[&str]) -> Option<Task> {
    let arg = strip_decorations(&directive.rest);
    if arg.is_empty() {
        return None;
    }
    let (path, start, end) = split_path_range(&arg);
    let payload = capture_payload(lines, directive.line_idx + 1);

    // 指定了行范围：载荷作为对这些行的替换；否则是全文替换
    let (content, new_text, insert_mode, target_start, target_end) = match (start, &payload) {
        (Some(s), Some(p)) => (
            None,
            Some(p.clone()),
            Some(InsertMode::Replace),
            Some(s),
            Some(end.unwrap_or(s)),
        ),
        (None, Some(p)) => (Some(p.clone()), None, None, None, None),
        (_, None) => (None, None, None, None, None),
    };

    Some(Task::EditFile {
        path,
        diff: None,
        diff_block: None,
        content,
        start_context: None,
        end_context: None,
        insert_mode,
        new_text,
        before_context: None,
        after_context: None,
        target_line: None,
        target_start_line: target_start,
        target_end_line: target_end,
    })
}

/// 抓取指令行之后的载荷
///
/// 优先：紧随其后（允许空行）的围栏代码块；
/// 回退：后续连续裸行，且整体被判为结构化而非叙述。
fn capture_payload(lines: &[&str], mut idx: usize) -> Option<String> {
    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }
    if idx >= lines.len() {
        return None;
    }

    if lines[idx].trim().starts_with("```") {
        let mut body = Vec::new();
        let mut j = idx + 1;
        while j < lines.len() {
            if lines[j].trim() == "```" {
                let payload = body.join("\n");
                return if payload.trim().is_empty() {
                    None
                } else {
                    Some(payload)
                };
            }
            body.push(lines[j]);
            j += 1;
        }
        // 未闭合围栏：不猜测边界
        return None;
    }

    // 裸行载荷：收集到下一条指令行或消息结束
    let mut body: Vec<&str> = Vec::new();
    let mut j = idx;
    while j < lines.len() {
        let trimmed = lines[j].trim();
        if trimmed.starts_with("```") {
            break;
        }
        if !is_conversational_line(lines[j]) && split_verb(trimmed).is_some() {
            break;
        }
        body.push(lines[j]);
        j += 1;
    }
    while body.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        body.pop();
    }
    if body.is_empty() || !is_structured_payload(&body) {
        return None;
    }
    Some(body.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::EditStrategy;

    #[test]
    fn test_read_with_range() {
        let tasks = parse_directives("READ src/main.rs:10-40\n");
        assert_eq!(tasks.len(), 1);
        match &tasks[0] {
            Task::ReadFile {
                path,
                start_line,
                end_line,
            } => {
                assert_eq!(path, "src/main.rs");
                assert_eq!(*start_line, Some(10));
                assert_eq!(*end_line, Some(40));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_edit_with_fenced_payload() {
        let text = "EDIT src/lib.rs\n```rust\npub fn hello() {}\n```\n";
        let tasks = parse_directives(text);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].edit_strategy(), Some(EditStrategy::FullContent));
    }

    #[test]
    fn test_edit_with_structured_bare_lines() {
        let text = "EDIT config/app.toml\nmax_retries = 3\ntimeout = 30\n";
        let tasks = parse_directives(text);
        assert_eq!(tasks.len(), 1);
        match &tasks[0] {
            Task::EditFile { content, .. } => {
                assert_eq!(content.as_deref(), Some("max_retries = 3\ntimeout = 30"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_edit_ignores_descriptive_lines() {
        let text = "EDIT src/lib.rs\nThis change makes the function cleaner\nand easier to read going forward\n";
        let tasks = parse_directives(text);
        // 有指令但载荷是散文：产出无载荷任务，由校验阶段报错
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].edit_strategy(), None);
    }

    #[test]
    fn test_conversational_mention_is_not_directive() {
        let text = "I'll READ src/main.rs and then fix it.\nThe file has been updated successfully.\n";
        assert!(parse_directives(text).is_empty());
    }

    #[test]
    fn test_duplicate_type_path_suppressed() {
        let text = "READ src/main.rs\nREAD src/main.rs\nREAD src/other.rs\n";
        let tasks = parse_directives(text);
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_run_keeps_raw_command() {
        let tasks = parse_directives("RUN cargo test -- --nocapture\n");
        match &tasks[0] {
            Task::RunShell { command, .. } => {
                assert_eq!(command, "cargo test -- --nocapture");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_edit_with_line_range_targets_lines() {
        let text = "EDIT src/lib.rs:5-7\n```\nreplacement\n```\n";
        let tasks = parse_directives(text);
        match &tasks[0] {
            Task::EditFile {
                target_start_line,
                target_end_line,
                new_text,
                ..
            } => {
                assert_eq!(*target_start_line, Some(5));
                assert_eq!(*target_end_line, Some(7));
                assert_eq!(new_text.as_deref(), Some("replacement"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_memory_and_todo_content() {
        let tasks = parse_directives("MEMORY user prefers tabs\nTODO add integration tests\n");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].type_name(), "Memory");
        assert_eq!(tasks[1].type_name(), "Todo");
    }
}
