//! 文件窗口读取
//!
//! 按行窗口返回文件内容：超大文件与二进制文件直接拒绝，返回文本先过脱敏，
//! 截断时附带机器可读的续读提示，让模型的下一次读取是确定的而不是猜的。

use std::path::Path;

use crate::config::ReadSection;
use crate::core::TaskError;
use crate::executor::redact::SecretRedactor;

/// 单行展示上限，超出截断
const MAX_LINE_CHARS: usize = 2000;

/// 读取结果：面向模型的文本 + 截断信息
#[derive(Debug)]
pub struct ReadResult {
    pub content: String,
    pub total_lines: usize,
    /// 实际返回的行窗口（1-based，闭区间）
    pub window: (usize, usize),
    pub truncated: bool,
}

/// 窗口读取；start/end 为 1-based 行号，未给定时从头读默认窗口
pub fn read_window(
    resolved: &Path,
    display_path: &str,
    section: &ReadSection,
    redactor: &SecretRedactor,
    start_line: Option<usize>,
    end_line: Option<usize>,
) -> Result<ReadResult, TaskError> {
    let metadata = std::fs::metadata(resolved)
        .map_err(|e| TaskError::Apply(format!("cannot stat '{}': {}", display_path, e)))?;
    if !metadata.is_file() {
        return Err(TaskError::Validation(format!(
            "'{}' is not a regular file",
            display_path
        )));
    }
    if metadata.len() > section.max_bytes {
        return Err(TaskError::Validation(format!(
            "'{}' is too large to read: {} bytes (max {})",
            display_path,
            metadata.len(),
            section.max_bytes
        )));
    }

    let bytes = std::fs::read(resolved)
        .map_err(|e| TaskError::Apply(format!("read failed for '{}': {}", display_path, e)))?;
    if bytes.iter().take(8192).any(|&b| b == 0) {
        return Err(TaskError::Validation(format!(
            "'{}' looks like a binary file; refusing to read",
            display_path
        )));
    }
    let content = String::from_utf8_lossy(&bytes);

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let start = start_line.unwrap_or(1);
    if total == 0 {
        return Ok(ReadResult {
            content: format!("File: {} (empty)\n", display_path),
            total_lines: 0,
            window: (0, 0),
            truncated: false,
        });
    }
    if start > total {
        return Err(TaskError::Validation(format!(
            "start_line {} is beyond end of '{}' ({} lines)",
            start, display_path, total
        )));
    }

    let window_cap = start + section.max_lines - 1;
    let end = end_line.unwrap_or(window_cap).min(window_cap).min(total);

    let mut out = format!(
        "File: {} (lines {}-{} of {})\n",
        display_path, start, end, total
    );
    for (offset, line) in lines[start - 1..end].iter().enumerate() {
        let shown: String = if line.chars().count() > MAX_LINE_CHARS {
            let cut: String = line.chars().take(MAX_LINE_CHARS).collect();
            format!("{}...", cut)
        } else {
            (*line).to_string()
        };
        out.push_str(&format!("{:4}: {}\n", start + offset, shown));
    }

    let truncated = end < total;
    if truncated {
        let next_end = (end + section.max_lines).min(total);
        out.push_str(&format!(
            "[continue] next_start_line={} next_end_line={} remaining_lines={}\n",
            end + 1,
            next_end,
            total - end
        ));
    }

    Ok(ReadResult {
        content: redactor.redact(&out),
        total_lines: total,
        window: (start, end),
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadSection;

    fn write_file(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_window_and_continue_hint() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        let path = write_file(dir.path(), "f.txt", &content);
        let section = ReadSection {
            max_lines: 10,
            max_bytes: 1024,
        };
        let result = read_window(
            &path,
            "f.txt",
            &section,
            &SecretRedactor::new(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(result.window, (1, 10));
        assert!(result.truncated);
        assert!(result.content.contains("next_start_line=11"));
        assert!(result.content.contains("next_end_line=20"));
    }

    #[test]
    fn test_explicit_range() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        let path = write_file(dir.path(), "f.txt", &content);
        let section = ReadSection::default();
        let result = read_window(
            &path,
            "f.txt",
            &section,
            &SecretRedactor::new(),
            Some(5),
            Some(8),
        )
        .unwrap();
        assert_eq!(result.window, (5, 8));
        assert!(result.content.contains("   5: line 5"));
        assert!(!result.content.contains("line 9"));
    }

    #[test]
    fn test_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin.dat");
        std::fs::write(&path, [0u8, 159, 146, 150]).unwrap();
        let err = read_window(
            &path,
            "bin.dat",
            &ReadSection::default(),
            &SecretRedactor::new(),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[test]
    fn test_redacts_secrets_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "env.txt", "API_KEY=supersecretvalue123\n");
        let result = read_window(
            &path,
            "env.txt",
            &ReadSection::default(),
            &SecretRedactor::new(),
            None,
            None,
        )
        .unwrap();
        assert!(!result.content.contains("supersecretvalue123"));
    }
}
