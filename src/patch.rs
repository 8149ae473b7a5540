//! diff-block 子系统
//!
//! 从模型消息中扫描 LOOM_EDIT 命令块，校验其为合法 unified diff 后逐块应用。
//! 外部 patch(1) 依赖收窄在 PatchEngine trait 之后，调用方不感知具体实现；
//! EditFile 的 unified-diff 策略则由本模块的进程内应用函数处理（严格模式，
//! 任一 hunk 不可应用即整体失败，不产生部分写入）。

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::TaskError;

/// 块起始标记（独占一行）
pub const BLOCK_START: &str = "<<<LOOM_EDIT>>>";
/// 块结束标记（独占一行）
pub const BLOCK_END: &str = "<<<END_LOOM_EDIT>>>";
/// 等价的围栏写法：```loom_edit ... ```
const FENCE_TAG: &str = "loom_edit";

/// 一个待应用的 diff 块：原始 diff 文本 + 从 `+++` 头提取的目标路径
///
/// 短生命周期对象：构造、校验、应用、丢弃，不持久化。
#[derive(Debug, Clone)]
pub struct EditBlock {
    pub raw: String,
    pub dest_path: String,
}

/// 消息中是否存在 diff 块（Manager 的短路检查用，不做校验）
pub fn contains_blocks(text: &str) -> bool {
    for line in text.lines() {
        let t = line.trim();
        if t == BLOCK_START {
            return true;
        }
        if let Some(tag) = t.strip_prefix("```") {
            if tag.trim().eq_ignore_ascii_case(FENCE_TAG) {
                return true;
            }
        }
    }
    false
}

/// 扫描消息中的全部块体（标记形式与围栏形式），不校验内容
pub fn scan_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut body: Vec<&str> = Vec::new();
    // 0 = 块外, 1 = 标记块内, 2 = 围栏块内
    let mut state = 0u8;

    for line in text.lines() {
        let t = line.trim();
        match state {
            0 => {
                if t == BLOCK_START {
                    state = 1;
                } else if let Some(tag) = t.strip_prefix("```") {
                    if tag.trim().eq_ignore_ascii_case(FENCE_TAG) {
                        state = 2;
                    }
                }
            }
            1 => {
                if t == BLOCK_END {
                    blocks.push(body.join("\n"));
                    body.clear();
                    state = 0;
                } else {
                    body.push(line);
                }
            }
            _ => {
                if t == "```" {
                    blocks.push(body.join("\n"));
                    body.clear();
                    state = 0;
                } else {
                    body.push(line);
                }
            }
        }
    }
    // 未闭合的块丢弃：宁可不执行也不猜测边界
    blocks
}

/// 校验块体为合法 unified diff 并提取目标路径
///
/// 要求：`--- ` 旧文件头、`+++ ` 新文件头、至少一个 `@@` hunk 头。
pub fn validate_block(raw: &str) -> Result<EditBlock, TaskError> {
    let has_old = raw.lines().any(|l| l.starts_with("--- "));
    if !has_old {
        return Err(TaskError::Parse(
            "diff block is missing the old-file header (--- a/<path>)".to_string(),
        ));
    }
    let dest = raw
        .lines()
        .find_map(|l| l.strip_prefix("+++ "))
        .map(|rest| {
            // `+++ b/src/main.rs\t2024-01-01` → `src/main.rs`
            let token = rest.split_whitespace().next().unwrap_or("");
            token.strip_prefix("b/").unwrap_or(token).to_string()
        })
        .ok_or_else(|| {
            TaskError::Parse(
                "diff block is missing the new-file header (+++ b/<path>)".to_string(),
            )
        })?;
    if dest.is_empty() || dest == "/dev/null" {
        return Err(TaskError::Parse(
            "diff block new-file header does not name a destination file".to_string(),
        ));
    }
    if !raw.lines().any(|l| l.starts_with("@@")) {
        return Err(TaskError::Parse(
            "diff block contains no @@ hunk header".to_string(),
        ));
    }
    Ok(EditBlock {
        raw: raw.to_string(),
        dest_path: dest,
    })
}

/// 扫描并校验消息中的所有块；任一块损坏则整体失败并指明是第几块
pub fn parse_blocks(text: &str) -> Result<Vec<EditBlock>, TaskError> {
    let mut out = Vec::new();
    for (idx, raw) in scan_blocks(text).into_iter().enumerate() {
        let block = validate_block(&raw)
            .map_err(|e| TaskError::Parse(format!("diff block #{}: {}", idx + 1, e)))?;
        out.push(block);
    }
    Ok(out)
}

/// diff 应用引擎：收窄的「应用一个 unified diff」接口
#[async_trait]
pub trait PatchEngine: Send + Sync {
    /// 在 workspace_root 下应用一个块；成功返回工具输出，失败报告原因
    async fn apply(&self, workspace_root: &Path, block: &EditBlock) -> Result<String, TaskError>;
}

/// 默认引擎：调用外部 patch(1)
///
/// `-p1 --batch`：剥一层前缀、不交互；部分命中的 hunk 由 patch 写入 .rej
/// 并以非零退出报告，不会被静默丢弃。
pub struct SystemPatchEngine {
    timeout_secs: u64,
}

impl SystemPatchEngine {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait]
impl PatchEngine for SystemPatchEngine {
    async fn apply(&self, workspace_root: &Path, block: &EditBlock) -> Result<String, TaskError> {
        let mut child = Command::new("patch")
            .args(["-p1", "--batch"])
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::Apply(format!("failed to spawn patch: {}", e)))?;

        let mut input = block.raw.clone();
        if !input.ends_with('\n') {
            input.push('\n');
        }
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| TaskError::Apply(format!("failed to feed patch stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| {
            TaskError::Apply(format!("patch timed out after {}s", self.timeout_secs))
        })?
        .map_err(|e| TaskError::Apply(format!("patch failed to run: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(TaskError::Apply(format!(
                "patch exited with {:?} for '{}': {} {}",
                output.status.code(),
                block.dest_path,
                stdout.trim(),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

/// hunk 内的一行
#[derive(Debug)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug)]
struct Hunk {
    /// 旧文件中的起始行（1-based；纯新增文件为 0）
    old_start: usize,
    lines: Vec<HunkLine>,
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, TaskError> {
    let header = Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk regex");
    let mut hunks: Vec<Hunk> = Vec::new();

    for line in diff.lines() {
        if let Some(caps) = header.captures(line) {
            let old_start: usize = caps[1].parse().map_err(|_| {
                TaskError::Apply(format!("invalid hunk header: {}", line))
            })?;
            hunks.push(Hunk {
                old_start,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            // 头部区域（---/+++/index 等）
            continue;
        };
        if line.starts_with('\\') {
            // "\ No newline at end of file"
            continue;
        }
        if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            // 新一段文件头意味着多文件 diff，策略 1 只接受单文件
            if rest.starts_with("-- ") {
                return Err(TaskError::Apply(
                    "multi-file diff is not accepted here; use a LOOM_EDIT block per file"
                        .to_string(),
                ));
            }
            hunk.lines.push(HunkLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if line.is_empty() {
            // 某些生成器省略上下文行的前导空格
            hunk.lines.push(HunkLine::Context(String::new()));
        }
    }

    if hunks.is_empty() {
        return Err(TaskError::Apply(
            "diff text contains no @@ hunks".to_string(),
        ));
    }
    Ok(hunks)
}

fn pattern_matches_at(old_lines: &[&str], pattern: &[&str], at: usize) -> bool {
    if at + pattern.len() > old_lines.len() {
        return false;
    }
    pattern
        .iter()
        .enumerate()
        .all(|(i, p)| old_lines[at + i] == *p)
}

/// 定位 hunk：先按声明位置验证，失败后要求全文唯一匹配，否则拒绝
fn locate_hunk(
    old_lines: &[&str],
    hunk: &Hunk,
    index: usize,
    min_pos: usize,
) -> Result<usize, TaskError> {
    let pattern: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
            HunkLine::Add(_) => None,
        })
        .collect();

    // 纯插入 hunk 没有可验证的旧行，按声明位置放置
    if pattern.is_empty() {
        let at = hunk.old_start.min(old_lines.len());
        return Ok(at.max(min_pos));
    }

    let declared = hunk.old_start.saturating_sub(1);
    if declared >= min_pos && pattern_matches_at(old_lines, &pattern, declared) {
        return Ok(declared);
    }

    let upper = old_lines.len().saturating_sub(pattern.len());
    let candidates: Vec<usize> = (min_pos..=upper)
        .filter(|&at| pattern_matches_at(old_lines, &pattern, at))
        .collect();
    match candidates.len() {
        1 => Ok(candidates[0]),
        0 => Err(TaskError::Apply(format!(
            "hunk #{} does not apply: context not found in current file content",
            index + 1
        ))),
        n => Err(TaskError::Apply(format!(
            "hunk #{} is ambiguous: context matches {} locations",
            index + 1,
            n
        ))),
    }
}

/// 进程内严格应用 unified diff：任一 hunk 不命中即整体失败，不做部分写入
pub fn apply_unified_diff(current: &str, diff: &str) -> Result<String, TaskError> {
    let hunks = parse_hunks(diff)?;
    let old_lines: Vec<&str> = current.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut pos = 0usize;

    for (i, hunk) in hunks.iter().enumerate() {
        let target = locate_hunk(&old_lines, hunk, i, pos)?;
        for l in &old_lines[pos..target] {
            out.push((*l).to_string());
        }
        let mut p = target;
        for hl in &hunk.lines {
            match hl {
                HunkLine::Context(s) => {
                    if old_lines.get(p).copied() != Some(s.as_str()) {
                        return Err(TaskError::Apply(format!(
                            "hunk #{} context mismatch at line {}",
                            i + 1,
                            p + 1
                        )));
                    }
                    out.push(s.clone());
                    p += 1;
                }
                HunkLine::Remove(s) => {
                    if old_lines.get(p).copied() != Some(s.as_str()) {
                        return Err(TaskError::Apply(format!(
                            "hunk #{} expects to remove line {} but content differs",
                            i + 1,
                            p + 1
                        )));
                    }
                    p += 1;
                }
                HunkLine::Add(s) => out.push(s.clone()),
            }
        }
        pos = p;
    }

    for l in &old_lines[pos..] {
        out.push((*l).to_string());
    }

    let mut result = out.join("\n");
    if !result.is_empty() && (current.is_empty() || current.ends_with('\n')) {
        result.push('\n');
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,3 @@\n fn main() {\n-    println!(\"old\");\n+    println!(\"new\");\n }\n";

    #[test]
    fn test_scan_marker_block() {
        let text = format!(
            "Applying the fix now.\n{}\n{}\n{}",
            BLOCK_START, SAMPLE_DIFF, BLOCK_END
        );
        let blocks = scan_blocks(&text);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("+++ b/src/lib.rs"));
    }

    #[test]
    fn test_scan_fenced_block() {
        let text = format!("```loom_edit\n{}```\n", SAMPLE_DIFF);
        let blocks = scan_blocks(&text);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_unclosed_block_is_dropped() {
        let text = format!("{}\n{}", BLOCK_START, SAMPLE_DIFF);
        assert!(scan_blocks(&text).is_empty());
    }

    #[test]
    fn test_validate_extracts_dest() {
        let block = validate_block(SAMPLE_DIFF).unwrap();
        assert_eq!(block.dest_path, "src/lib.rs");
    }

    #[test]
    fn test_validate_rejects_missing_hunk() {
        let raw = "--- a/x\n+++ b/x\nno hunks here\n";
        assert!(validate_block(raw).is_err());
    }

    #[test]
    fn test_apply_simple_replace() {
        let current = "fn main() {\n    println!(\"old\");\n}\n";
        let result = apply_unified_diff(current, SAMPLE_DIFF).unwrap();
        assert_eq!(result, "fn main() {\n    println!(\"new\");\n}\n");
    }

    #[test]
    fn test_apply_rejects_stale_context() {
        let current = "fn main() {\n    println!(\"already changed\");\n}\n";
        let err = apply_unified_diff(current, SAMPLE_DIFF).unwrap_err();
        assert!(matches!(err, TaskError::Apply(_)));
    }

    #[test]
    fn test_apply_relocated_hunk() {
        // 文件头部多了两行，声明的行号过期，但上下文唯一
        let current = "// header\n// more\nfn main() {\n    println!(\"old\");\n}\n";
        let result = apply_unified_diff(current, SAMPLE_DIFF).unwrap();
        assert!(result.contains("println!(\"new\")"));
        assert!(result.starts_with("// header\n"));
    }

    #[test]
    fn test_apply_preserves_untouched_lines() {
        let current = "a\nb\nc\nd\ne\n";
        let diff = "--- a/f\n+++ b/f\n@@ -2,3 +2,3 @@\n b\n-c\n+C\n d\n";
        let result = apply_unified_diff(current, diff).unwrap();
        assert_eq!(result, "a\nb\nC\nd\ne\n");
    }
}
