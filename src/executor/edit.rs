//! 编辑引擎
//!
//! EditFile 的三种进程内策略在此实现：unified diff、全文替换（带防截断与
//! 结构回归启发式）、上下文锚点编辑（含 SafeEdit 双侧上下文门禁）。
//! 所有策略都是两阶段：prepare 计算出新内容 + diff 预览 + 统计，apply 才
//! 落盘；新内容与当前内容完全一致时标记 is_identical_content，不写盘。

use regex::Regex;
use similar::{ChangeTag, TextDiff};

use crate::core::TaskError;
use crate::task::{EditSummary, InsertMode, Task};

/// prepare 的产物：待写内容与给模型看的预览
#[derive(Debug)]
pub struct PreparedEdit {
    pub new_content: String,
    pub summary: EditSummary,
    pub preview: String,
}

/// 计算一次编辑的预期结果；不触碰磁盘
///
/// diff_block 载荷不走这里，由 patch 子系统整体接管。
pub fn prepare_edit(
    display_path: &str,
    current: &str,
    file_exists: bool,
    task: &Task,
) -> Result<PreparedEdit, TaskError> {
    let Task::EditFile {
        diff,
        content,
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
        return Err(TaskError::Validation(
            "prepare_edit called with a non-edit task".to_string(),
        ));
    };

    let new_content = if let Some(diff_text) = diff {
        crate::patch::apply_unified_diff(current, diff_text)?
    } else if let Some(replacement) = content {
        if file_exists {
            full_replacement_guard(display_path, current, replacement)?;
        }
        replacement.clone()
    } else {
        apply_anchored(
            display_path,
            current,
            file_exists,
            AnchoredFields {
                start_context: start_context.as_deref(),
                end_context: end_context.as_deref(),
                insert_mode: *insert_mode,
                new_text: new_text.as_deref().unwrap_or(""),
                before_context: before_context.as_deref(),
                after_context: after_context.as_deref(),
                target_line: *target_line,
                target_start_line: *target_start_line,
                target_end_line: *target_end_line,
            },
        )?
    };

    let summary = EditSummary::compute(current, &new_content);
    let preview = if summary.is_identical_content {
        String::new()
    } else {
        diff_preview(current, &new_content)
    };
    Ok(PreparedEdit {
        new_content,
        summary,
        preview,
    })
}

/// 行级 diff 预览：变更行带 +/-，左右各留两行上下文，间隔用 ... 省略
pub fn diff_preview(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut out = String::new();
    for (i, group) in diff.grouped_ops(2).iter().enumerate() {
        if i > 0 {
            out.push_str("...\n");
        }
        for op in group {
            for change in diff.iter_changes(op) {
                let sign = match change.tag() {
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                    ChangeTag::Equal => ' ',
                };
                out.push(sign);
                out.push_str(change.value().trim_end_matches('\n'));
                out.push('\n');
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// 全文替换防护
// ---------------------------------------------------------------------------

/// 防截断与结构回归启发式
///
/// 宁可误拒少数真实的大幅缩短，也要挡住「模型只回了半个文件」这类
/// 静默截断；触发时的修复动作永远是让模型重读文件再来。
fn full_replacement_guard(
    display_path: &str,
    old: &str,
    new: &str,
) -> Result<(), TaskError> {
    let old_lines = old.lines().count();
    let new_lines = new.lines().count();
    if old_lines > 10 && new_lines < old_lines / 2 {
        return Err(TaskError::EditSafety(format!(
            "replacement for '{}' shrinks the file from {} to {} lines; \
             this looks like truncated content. Re-read the file and send the full content",
            display_path, old_lines, new_lines
        )));
    }
    if old.len() > 500 && new.len() < old.len() / 3 {
        return Err(TaskError::EditSafety(format!(
            "replacement for '{}' shrinks the file from {} to {} bytes; \
             this looks like truncated content. Re-read the file and send the full content",
            display_path,
            old.len(),
            new.len()
        )));
    }

    let ext = display_path.rsplit('.').next().unwrap_or("");
    match ext {
        "rs" | "c" | "h" | "cpp" | "cc" | "hpp" | "java" | "js" | "jsx" | "ts" | "tsx"
        | "go" | "cs" | "kt" | "swift" => {
            if brace_balance(old) == 0 && brace_balance(new) != 0 {
                return Err(TaskError::EditSafety(format!(
                    "replacement for '{}' has unbalanced braces; the original was balanced. \
                     Re-read the file and send complete content",
                    display_path
                )));
            }
        }
        "json" => {
            if json_terminated(old) && !json_terminated(new) {
                return Err(TaskError::EditSafety(format!(
                    "replacement for '{}' leaves a JSON array/object unterminated. \
                     Re-read the file and send complete content",
                    display_path
                )));
            }
        }
        "md" | "markdown" => {
            let old_headers = header_count(old);
            let new_headers = header_count(new);
            if old_headers >= 3 && new_headers * 3 < old_headers {
                return Err(TaskError::EditSafety(format!(
                    "replacement for '{}' collapses markdown headers from {} to {}. \
                     Re-read the file and send complete content",
                    display_path, old_headers, new_headers
                )));
            }
        }
        "toml" | "ini" | "conf" | "cfg" | "env" | "yaml" | "yml" | "properties" => {
            let old_kv = kv_count(old);
            let new_kv = kv_count(new);
            if old_kv >= 3 && new_kv * 3 < old_kv {
                return Err(TaskError::EditSafety(format!(
                    "replacement for '{}' loses key-value structure ({} -> {} entries). \
                     Re-read the file and send complete content",
                    display_path, old_kv, new_kv
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

fn brace_balance(text: &str) -> i64 {
    let mut balance = 0i64;
    for c in text.chars() {
        match c {
            '{' => balance += 1,
            '}' => balance -= 1,
            _ => {}
        }
    }
    balance
}

fn json_terminated(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let last_ok = trimmed.ends_with('}') || trimmed.ends_with(']');
    let mut braces = 0i64;
    let mut brackets = 0i64;
    for c in trimmed.chars() {
        match c {
            '{' => braces += 1,
            '}' => braces -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }
    }
    last_ok && braces == 0 && brackets == 0
}

fn header_count(text: &str) -> usize {
    text.lines().filter(|l| l.trim_start().starts_with('#')).count()
}

fn kv_count(text: &str) -> usize {
    let re = kv_regex();
    text.lines().filter(|l| re.is_match(l)).count()
}

fn kv_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[\w.\-]+\s*[:=]\s*\S").expect("kv regex"))
}

// ---------------------------------------------------------------------------
// 锚点与 SafeEdit
// ---------------------------------------------------------------------------

struct AnchoredFields<'a> {
    start_context: Option<&'a str>,
    end_context: Option<&'a str>,
    insert_mode: Option<InsertMode>,
    new_text: &'a str,
    before_context: Option<&'a str>,
    after_context: Option<&'a str>,
    target_line: Option<usize>,
    target_start_line: Option<usize>,
    target_end_line: Option<usize>,
}

fn apply_anchored(
    display_path: &str,
    current: &str,
    file_exists: bool,
    fields: AnchoredFields<'_>,
) -> Result<String, TaskError> {
    if !file_exists {
        return Err(TaskError::EditSafety(format!(
            "'{}' does not exist; anchored edits need an existing file. \
             Use full content to create it",
            display_path
        )));
    }

    // SafeEdit：双侧上下文必须紧贴目标行，证明模型对文件状态的认知与现实一致
    if let (Some(before), Some(after)) = (fields.before_context, fields.after_context) {
        let (start, end) = match (
            fields.target_line,
            fields.target_start_line,
            fields.target_end_line,
        ) {
            (Some(line), _, _) => (line, line),
            (None, Some(s), Some(e)) => (s, e),
            _ => {
                return Err(TaskError::Validation(format!(
                    "safe edit for '{}' is missing its target line(s)",
                    display_path
                )))
            }
        };
        return apply_safe_edit(display_path, current, before, after, start, end, fields.new_text);
    }

    let had_newline = current.ends_with('\n') || current.is_empty();
    let mut lines: Vec<String> = current.lines().map(String::from).collect();
    let new_lines: Vec<String> = fields.new_text.lines().map(String::from).collect();

    // 纯行号目标（无上下文门禁）：直接替换范围
    if fields.start_context.is_none() {
        if let Some(start) = fields.target_start_line.or(fields.target_line) {
            let end = fields.target_end_line.unwrap_or(start);
            if start == 0 || end > lines.len() {
                return Err(TaskError::EditSafety(format!(
                    "target lines {}-{} are out of range for '{}' ({} lines); re-read the file",
                    start,
                    end,
                    display_path,
                    lines.len()
                )));
            }
            lines.splice(start - 1..end, new_lines);
            return Ok(join_lines(lines, had_newline));
        }
    }

    let mode = fields.insert_mode.ok_or_else(|| {
        TaskError::Validation(format!(
            "anchored edit for '{}' is missing 'insert_mode'",
            display_path
        ))
    })?;

    match mode {
        InsertMode::Append => {
            lines.extend(new_lines);
            Ok(join_lines(lines, had_newline))
        }
        InsertMode::ReplaceAll => {
            let anchor = fields.start_context.unwrap_or("");
            if !current.contains(anchor) {
                return Err(anchor_not_found(display_path, anchor));
            }
            Ok(current.replace(anchor, fields.new_text))
        }
        InsertMode::InsertBetween => {
            let start_anchor = fields.start_context.unwrap_or("");
            let end_anchor = fields.end_context.unwrap_or("");
            let start_idx = find_anchor(&lines, start_anchor)
                .ok_or_else(|| anchor_not_found(display_path, start_anchor))?;
            // 终止锚必须出现在起始锚之后
            find_anchor(&lines[start_idx + 1..], end_anchor)
                .ok_or_else(|| anchor_not_found(display_path, end_anchor))?;
            lines.splice(start_idx + 1..start_idx + 1, new_lines);
            Ok(join_lines(lines, had_newline))
        }
        InsertMode::InsertBefore | InsertMode::InsertAfter | InsertMode::Replace => {
            let anchor = fields.start_context.unwrap_or("");
            let idx = find_anchor(&lines, anchor)
                .ok_or_else(|| anchor_not_found(display_path, anchor))?;
            match mode {
                InsertMode::InsertBefore => {
                    lines.splice(idx..idx, new_lines);
                }
                InsertMode::InsertAfter => {
                    lines.splice(idx + 1..idx + 1, new_lines);
                }
                _ => {
                    // Replace：给了 end_context 就替换两锚之间的闭区间
                    let end_idx = match fields.end_context {
                        Some(end_anchor) => find_anchor(&lines[idx..], end_anchor)
                            .map(|i| i + idx)
                            .ok_or_else(|| anchor_not_found(display_path, end_anchor))?,
                        None => idx,
                    };
                    lines.splice(idx..=end_idx, new_lines);
                }
            }
            Ok(join_lines(lines, had_newline))
        }
    }
}

fn anchor_not_found(display_path: &str, anchor: &str) -> TaskError {
    TaskError::EditSafety(format!(
        "anchor not found in '{}': '{}'. Re-read the file to see its current content",
        display_path, anchor
    ))
}

fn join_lines(lines: Vec<String>, trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// 锚点定位阶梯：整行精确 -> 大小写不敏感子串 -> 含元字符时按正则
fn find_anchor(lines: &[String], anchor: &str) -> Option<usize> {
    let anchor_lines: Vec<&str> = anchor.lines().collect();
    if anchor_lines.len() > 1 {
        // 多行锚：连续整行匹配（忽略首尾空白差异）
        let n = anchor_lines.len();
        for i in 0..lines.len().saturating_sub(n - 1) {
            if anchor_lines
                .iter()
                .enumerate()
                .all(|(j, a)| lines[i + j].trim() == a.trim())
            {
                return Some(i);
            }
        }
        return None;
    }

    let single = anchor_lines.first().copied().unwrap_or(anchor);
    if let Some(idx) = lines.iter().position(|l| l == single) {
        return Some(idx);
    }
    let lower = single.to_lowercase();
    if !lower.trim().is_empty() {
        if let Some(idx) = lines
            .iter()
            .position(|l| l.to_lowercase().contains(&lower))
        {
            return Some(idx);
        }
    }
    if has_regex_metachars(single) {
        if let Ok(re) = Regex::new(single) {
            return lines.iter().position(|l| re.is_match(l));
        }
    }
    None
}

fn has_regex_metachars(text: &str) -> bool {
    text.chars()
        .any(|c| matches!(c, '\\' | '^' | '$' | '.' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']'))
}

/// 模型把读取结果里的行号一起抄回来时，剥掉 `NN:` / `NN |` 前缀
fn strip_line_number_prefix(line: &str) -> &str {
    let re = line_prefix_regex();
    match re.find(line) {
        Some(m) if m.start() == 0 => &line[m.end()..],
        _ => line,
    }
}

fn line_prefix_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+\s*[:|]\s?").expect("line prefix regex"))
}

/// SafeEdit：before/after 上下文必须紧贴目标行，全部吻合才允许替换
#[allow(clippy::too_many_arguments)]
fn apply_safe_edit(
    display_path: &str,
    current: &str,
    before_context: &str,
    after_context: &str,
    target_start: usize,
    target_end: usize,
    new_text: &str,
) -> Result<String, TaskError> {
    let had_newline = current.ends_with('\n') || current.is_empty();
    let mut lines: Vec<String> = current.lines().map(String::from).collect();

    if target_start == 0 || target_end < target_start || target_end > lines.len() {
        return Err(TaskError::EditSafety(format!(
            "target lines {}-{} are out of range for '{}' ({} lines); re-read the file",
            target_start,
            target_end,
            display_path,
            lines.len()
        )));
    }

    let before_lines: Vec<&str> = before_context
        .lines()
        .map(strip_line_number_prefix)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let after_lines: Vec<&str> = after_context
        .lines()
        .map(strip_line_number_prefix)
        .filter(|l| !l.trim().is_empty())
        .collect();

    // 紧贴目标行之前
    if before_lines.len() > target_start - 1 {
        return Err(safe_context_mismatch(display_path, "before_context", &before_lines, "(start of file)"));
    }
    let before_slice = &lines[target_start - 1 - before_lines.len()..target_start - 1];
    for (expected, actual) in before_lines.iter().zip(before_slice.iter()) {
        if expected.trim() != actual.trim() {
            return Err(safe_context_mismatch(
                display_path,
                "before_context",
                &before_lines,
                actual,
            ));
        }
    }

    // 紧贴目标行之后
    if target_end + after_lines.len() > lines.len() {
        return Err(safe_context_mismatch(display_path, "after_context", &after_lines, "(end of file)"));
    }
    let after_slice = &lines[target_end..target_end + after_lines.len()];
    for (expected, actual) in after_lines.iter().zip(after_slice.iter()) {
        if expected.trim() != actual.trim() {
            return Err(safe_context_mismatch(
                display_path,
                "after_context",
                &after_lines,
                actual,
            ));
        }
    }

    let new_lines: Vec<String> = new_text.lines().map(String::from).collect();
    lines.splice(target_start - 1..target_end, new_lines);
    Ok(join_lines(lines, had_newline))
}

fn safe_context_mismatch(
    display_path: &str,
    which: &str,
    expected: &[&str],
    actual: &str,
) -> TaskError {
    TaskError::EditSafety(format!(
        "{} does not match the current content of '{}': expected {:?}, found '{}'. \
         The file differs from what you last saw; re-read it and retry",
        which, display_path, expected, actual
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit_task(path: &str) -> Task {
        Task::EditFile {
            path: path.to_string(),
            diff: None,
            diff_block: None,
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
        }
    }

    fn twenty_lines() -> String {
        (1..=20).map(|i| format!("line {}\n", i)).collect()
    }

    #[test]
    fn test_anti_truncation_line_rule() {
        let old = twenty_lines();
        let short: String = (1..=9).map(|i| format!("line {}\n", i)).collect();
        let err = full_replacement_guard("f.txt", &old, &short).unwrap_err();
        assert!(matches!(err, TaskError::EditSafety(_)));

        let ok: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        assert!(full_replacement_guard("f.txt", &old, &ok).is_ok());
    }

    #[test]
    fn test_byte_rule() {
        let old = "x".repeat(600);
        let new = "x".repeat(150);
        let err = full_replacement_guard("notes.txt", &old, &new).unwrap_err();
        assert!(matches!(err, TaskError::EditSafety(_)));
    }

    #[test]
    fn test_brace_regression() {
        let old = "fn a() {\n}\nfn b() {\n}\n";
        let new = "fn a() {\nfn b() {\n}\n";
        assert!(full_replacement_guard("src/lib.rs", old, new).is_err());
        // 原文件本来就不平衡时不拦
        let broken_old = "fn a() {\n";
        assert!(full_replacement_guard("src/lib.rs", broken_old, new).is_ok());
    }

    #[test]
    fn test_json_termination() {
        let old = "{\"a\": [1, 2]}\n";
        let new = "{\"a\": [1, 2\n";
        assert!(full_replacement_guard("data.json", old, new).is_err());
    }

    #[test]
    fn test_markdown_header_collapse() {
        let old = "# a\n## b\n## c\n## d\ntext\n";
        let new = "just text now\n";
        assert!(full_replacement_guard("README.md", old, new).is_err());
    }

    #[test]
    fn test_config_kv_collapse() {
        let old = "a = 1\nb = 2\nc = 3\nd = 4\n";
        let new = "# all gone\n";
        assert!(full_replacement_guard("app.toml", old, new).is_err());
    }

    #[test]
    fn test_insert_after_keeps_other_lines() {
        let current = "alpha\nbeta\ngamma\n";
        let mut task = edit_task("f.txt");
        if let Task::EditFile {
            start_context,
            insert_mode,
            new_text,
            ..
        } = &mut task
        {
            *start_context = Some("beta".to_string());
            *insert_mode = Some(InsertMode::InsertAfter);
            *new_text = Some("inserted".to_string());
        }
        let prepared = prepare_edit("f.txt", current, true, &task).unwrap();
        assert_eq!(prepared.new_content, "alpha\nbeta\ninserted\ngamma\n");
    }

    #[test]
    fn test_anchor_ladder_case_insensitive() {
        let lines: Vec<String> = vec!["fn Main() {".to_string(), "}".to_string()];
        assert_eq!(find_anchor(&lines, "fn main"), Some(0));
    }

    #[test]
    fn test_anchor_regex_fallback() {
        let lines: Vec<String> = vec!["let total_count = 42;".to_string()];
        assert_eq!(find_anchor(&lines, r"let \w+_count"), Some(0));
    }

    #[test]
    fn test_anchor_not_found_is_edit_safety() {
        let current = "alpha\n";
        let mut task = edit_task("f.txt");
        if let Task::EditFile {
            start_context,
            insert_mode,
            new_text,
            ..
        } = &mut task
        {
            *start_context = Some("missing anchor".to_string());
            *insert_mode = Some(InsertMode::Replace);
            *new_text = Some("x".to_string());
        }
        let err = prepare_edit("f.txt", current, true, &task).unwrap_err();
        assert!(matches!(err, TaskError::EditSafety(_)));
        assert!(err.to_string().contains("missing anchor"));
    }

    #[test]
    fn test_replace_all_literal() {
        let current = "foo bar foo\nfoo\n";
        let mut task = edit_task("f.txt");
        if let Task::EditFile {
            start_context,
            insert_mode,
            new_text,
            ..
        } = &mut task
        {
            *start_context = Some("foo".to_string());
            *insert_mode = Some(InsertMode::ReplaceAll);
            *new_text = Some("qux".to_string());
        }
        let prepared = prepare_edit("f.txt", current, true, &task).unwrap();
        assert_eq!(prepared.new_content, "qux bar qux\nqux\n");
    }

    #[test]
    fn test_safe_edit_applies_when_context_matches() {
        let current = "one\ntwo\nthree\nfour\nfive\n";
        let result = apply_safe_edit("f.txt", current, "two", "four", 3, 3, "THREE").unwrap();
        assert_eq!(result, "one\ntwo\nTHREE\nfour\nfive\n");
    }

    #[test]
    fn test_safe_edit_rejects_context_mismatch() {
        let current = "one\ntwo\nthree\nfour\nfive\n";
        let err =
            apply_safe_edit("f.txt", current, "NOT-two", "four", 3, 3, "THREE").unwrap_err();
        assert!(matches!(err, TaskError::EditSafety(_)));
        assert!(err.to_string().contains("re-read"));
    }

    #[test]
    fn test_safe_edit_strips_echoed_line_numbers() {
        let current = "one\ntwo\nthree\nfour\nfive\n";
        let result =
            apply_safe_edit("f.txt", current, "   2: two", "   4: four", 3, 3, "THREE").unwrap();
        assert!(result.contains("THREE"));
    }

    #[test]
    fn test_identical_content_flag() {
        let current = "same\n";
        let mut task = edit_task("f.txt");
        if let Task::EditFile { content, .. } = &mut task {
            *content = Some("same\n".to_string());
        }
        let prepared = prepare_edit("f.txt", current, true, &task).unwrap();
        assert!(prepared.summary.is_identical_content);
        assert!(prepared.preview.is_empty());
    }

    #[test]
    fn test_insert_between() {
        let current = "start\nend\n";
        let mut task = edit_task("f.txt");
        if let Task::EditFile {
            start_context,
            end_context,
            insert_mode,
            new_text,
            ..
        } = &mut task
        {
            *start_context = Some("start".to_string());
            *end_context = Some("end".to_string());
            *insert_mode = Some(InsertMode::InsertBetween);
            *new_text = Some("middle".to_string());
        }
        let prepared = prepare_edit("f.txt", current, true, &task).unwrap();
        assert_eq!(prepared.new_content, "start\nmiddle\nend\n");
    }

    #[test]
    fn test_unified_diff_strategy() {
        let current = "a\nb\nc\n";
        let mut task = edit_task("f.txt");
        if let Task::EditFile { diff, .. } = &mut task {
            *diff = Some("--- a/f.txt\n+++ b/f.txt\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n".to_string());
        }
        let prepared = prepare_edit("f.txt", current, true, &task).unwrap();
        assert_eq!(prepared.new_content, "a\nB\nc\n");
        assert!(prepared.preview.contains("+B"));
    }
}
