//! JSON 任务解析（解析链第三、四级）
//!
//! 第三级：围栏代码块内的 `{"tasks":[...]}` 或单个 `{"type":...}` 对象，
//! 先试任务列表形状，再试单任务形状；第四级：围栏外裸行中的 JSON 对象，
//! 其 "type" 字段必须是已知变体。识别出任务形状但 JSON 损坏时报 Parse 错误。

use serde::Deserialize;

use crate::core::TaskError;
use crate::task::Task;

/// 已知的任务变体名；裸 JSON 行只有命中其一才尝试解析
const KNOWN_TYPES: &[&str] = &[
    "ReadFile", "EditFile", "ListDir", "RunShell", "Search", "Memory", "Todo",
];

#[derive(Deserialize)]
struct TaskListDoc {
    tasks: Vec<Task>,
}

/// 第三级：围栏 JSON
pub fn parse_fenced_json(text: &str) -> Result<Vec<Task>, TaskError> {
    let mut tasks = Vec::new();
    for body in fenced_bodies(text) {
        let trimmed = body.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        if !looks_task_shaped(trimmed) {
            continue;
        }
        // 任务列表形状优先
        if trimmed.contains("\"tasks\"") {
            let doc: TaskListDoc = serde_json::from_str(trimmed)
                .map_err(|e| TaskError::Parse(format!("broken task-list JSON: {}", e)))?;
            tasks.extend(doc.tasks);
            continue;
        }
        let task: Task = serde_json::from_str(trimmed)
            .map_err(|e| TaskError::Parse(format!("broken task JSON: {}", e)))?;
        tasks.push(task);
    }
    Ok(tasks)
}

/// 第四级：裸 JSON 回退
///
/// 在围栏外扫描以 `{` 开头的行，按花括号深度聚合成候选对象；只有 "type"
/// 命中已知变体的候选才会被解析，解析失败报 Parse 错误。
pub fn parse_bare_json(text: &str) -> Result<Vec<Task>, TaskError> {
    let mut tasks = Vec::new();
    for candidate in bare_json_candidates(text) {
        let value: serde_json::Value = match serde_json::from_str(&candidate) {
            Ok(v) => v,
            // 无法解析的花括号片段当作普通文本噪音
            Err(_) => continue,
        };
        let Some(type_name) = value.get("type").and_then(|v| v.as_str()).map(|s| s.to_string()) else {
            continue;
        };
        if !KNOWN_TYPES.contains(&type_name.as_str()) {
            continue;
        }
        let task: Task = serde_json::from_value(value)
            .map_err(|e| TaskError::Parse(format!("broken {} task JSON: {}", type_name, e)))?;
        tasks.push(task);
    }
    Ok(tasks)
}

/// 提取全部围栏块体（任意语言标签）
fn fenced_bodies(text: &str) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut body: Vec<&str> = Vec::new();
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if !in_fence {
            if trimmed.starts_with("```") {
                in_fence = true;
            }
            continue;
        }
        if trimmed == "```" {
            bodies.push(body.join("\n"));
            body.clear();
            in_fence = false;
        } else {
            body.push(line);
        }
    }
    bodies
}

fn looks_task_shaped(body: &str) -> bool {
    body.contains("\"type\"") || body.contains("\"tasks\"")
}

/// 围栏外按花括号深度聚合 JSON 候选（字符串内的花括号按引号状态忽略）
fn bare_json_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut depth = 0i32;
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if depth == 0 {
            if !trimmed.starts_with('{') {
                continue;
            }
            current.clear();
        }
        current.push(trimmed);
        depth += brace_delta(trimmed);
        if depth <= 0 {
            if depth == 0 && !current.is_empty() {
                candidates.push(current.join("\n"));
            }
            current.clear();
            depth = 0;
        }
    }
    candidates
}

fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => delta += 1,
            '}' if !in_string => delta -= 1,
            _ => {}
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_single_task() {
        let text = "Next step:\n```json\n{\"type\": \"ReadFile\", \"path\": \"src/main.rs\"}\n```\n";
        let tasks = parse_fenced_json(text).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].type_name(), "ReadFile");
    }

    #[test]
    fn test_fenced_task_list() {
        let text = "```json\n{\"tasks\": [{\"type\": \"ListDir\", \"path\": \"src\"}, {\"type\": \"Search\", \"query\": \"fn main\"}]}\n```\n";
        let tasks = parse_fenced_json(text).unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_fenced_broken_json_is_parse_error() {
        let text = "```json\n{\"type\": \"ReadFile\", \"path\": \n```\n";
        assert!(parse_fenced_json(text).is_err());
    }

    #[test]
    fn test_fenced_non_task_json_ignored() {
        let text = "```json\n{\"name\": \"demo\", \"version\": 1}\n```\n";
        let tasks = parse_fenced_json(text).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_bare_json_known_type() {
        let text = "Running this now:\n{\"type\": \"RunShell\", \"command\": \"cargo check\"}\nDone.\n";
        let tasks = parse_bare_json(text).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].type_name(), "RunShell");
    }

    #[test]
    fn test_bare_json_unknown_type_skipped() {
        let text = "{\"type\": \"object\", \"properties\": {}}\n";
        let tasks = parse_bare_json(text).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_bare_multiline_json() {
        let text = "{\n  \"type\": \"Search\",\n  \"query\": \"TODO\"\n}\n";
        let tasks = parse_bare_json(text).unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
