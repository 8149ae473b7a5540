//! 目录列举
//!
//! 受条数、深度与输出字节数三重限额约束；跳过/不跳过的判断交给外部
//! IgnoreMatcher 协作者，默认实现 = 内置跳过规则 + 配置里的 glob 模式。

use std::path::Path;

use crate::config::ListSection;
use crate::core::TaskError;
use crate::executor::workspace::Workspace;

/// 忽略模式协作者：决定一个条目是否跳过
pub trait IgnoreMatcher: Send + Sync {
    fn should_skip(&self, name: &str, is_dir: bool) -> bool;
}

/// 默认忽略规则：隐藏项、构建产物目录，外加配置的 glob 模式
pub struct DefaultIgnore {
    globs: Vec<glob::Pattern>,
}

impl DefaultIgnore {
    pub fn new(patterns: &[String]) -> Self {
        let globs = patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();
        Self { globs }
    }
}

impl IgnoreMatcher for DefaultIgnore {
    fn should_skip(&self, name: &str, is_dir: bool) -> bool {
        if name.starts_with('.') {
            return true;
        }
        if is_dir && matches!(name, "target" | "node_modules" | "__pycache__" | "dist") {
            return true;
        }
        self.globs.iter().any(|g| g.matches(name))
    }
}

/// 递归列举目录；返回工作区相对路径列表（目录带 / 后缀）
pub fn list_dir(
    ws: &Workspace,
    section: &ListSection,
    matcher: &dyn IgnoreMatcher,
    path: &str,
) -> Result<String, TaskError> {
    let base = ws.resolve(path)?;
    if !base.is_dir() {
        return Err(TaskError::Validation(format!(
            "'{}' is not a directory",
            path
        )));
    }

    let mut entries: Vec<String> = Vec::new();
    let mut truncated = false;
    let walker = walkdir::WalkDir::new(&base)
        .min_depth(1)
        .max_depth(section.max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !matcher.should_skip(&name, e.file_type().is_dir())
        });

    for entry in walker.filter_map(|e| e.ok()) {
        if entries.len() >= section.max_entries {
            truncated = true;
            break;
        }
        let rel = relative_display(&base, entry.path());
        if entry.file_type().is_dir() {
            entries.push(format!("{}/", rel));
        } else {
            entries.push(rel);
        }
    }

    let mut out = entries.join("\n");
    if out.len() > section.max_output_bytes {
        let mut cut = section.max_output_bytes;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        truncated = true;
    }
    if truncated {
        out.push_str("\n... (listing truncated)");
    }
    if out.is_empty() {
        out.push_str("(empty)");
    }
    Ok(out)
}

fn relative_display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join(".git/config"), "x").unwrap();

        let ws = Workspace::new(dir.path());
        let matcher = DefaultIgnore::new(&[]);
        let out = list_dir(&ws, &ListSection::default(), &matcher, ".").unwrap();
        assert!(out.contains("src/"));
        assert!(out.contains("main.rs"));
        assert!(!out.contains(".git"));
        assert!(!out.contains("target"));
    }

    #[test]
    fn test_entry_limit_truncates() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            std::fs::write(dir.path().join(format!("f{:02}.txt", i)), "x").unwrap();
        }
        let ws = Workspace::new(dir.path());
        let section = ListSection {
            max_entries: 5,
            ..ListSection::default()
        };
        let out = list_dir(&ws, &section, &DefaultIgnore::new(&[]), ".").unwrap();
        assert!(out.contains("truncated"));
        assert_eq!(out.lines().filter(|l| l.ends_with(".txt")).count(), 5);
    }

    #[test]
    fn test_glob_ignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.rs"), "x").unwrap();
        std::fs::write(dir.path().join("skip.log"), "x").unwrap();
        let ws = Workspace::new(dir.path());
        let matcher = DefaultIgnore::new(&["*.log".to_string()]);
        let out = list_dir(&ws, &ListSection::default(), &matcher, ".").unwrap();
        assert!(out.contains("keep.rs"));
        assert!(!out.contains("skip.log"));
    }
}
