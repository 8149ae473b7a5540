//! 文本搜索协作者
//!
//! Search 任务把查询交给外部文本搜索工具；SearchProvider 是那条边界。
//! 默认实现进程内扫描（walkdir + regex），避免对 grep/ripgrep 可执行文件的
//! 硬依赖；查询不是合法正则时退化为字面量匹配。

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;

use crate::config::SearchSection;
use crate::core::TaskError;

/// 一条命中：路径、1-based 行号、行文本
pub struct SearchHit {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// 外部文本搜索协作者接口
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        root: &Path,
        query: &str,
        sub_path: Option<&str>,
    ) -> Result<Vec<SearchHit>, TaskError>;
}

/// 默认搜索：进程内递归扫描
pub struct GrepSearch {
    section: SearchSection,
}

impl GrepSearch {
    pub fn new(section: SearchSection) -> Self {
        Self { section }
    }
}

#[async_trait]
impl SearchProvider for GrepSearch {
    async fn search(
        &self,
        root: &Path,
        query: &str,
        sub_path: Option<&str>,
    ) -> Result<Vec<SearchHit>, TaskError> {
        let base = match sub_path {
            Some(p) => root.join(p),
            None => root.to_path_buf(),
        };
        let regex = Regex::new(query)
            .or_else(|_| Regex::new(&regex::escape(query)))
            .map_err(|e| TaskError::Validation(format!("unusable search query: {}", e)))?;

        let mut hits = Vec::new();
        let walker = walkdir::WalkDir::new(&base)
            .max_depth(16)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !(name.starts_with('.')
                    || (e.file_type().is_dir()
                        && matches!(name.as_ref(), "target" | "node_modules" | "__pycache__")))
            });

        'outer: for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .metadata()
                .map(|m| m.len() > self.section.max_file_bytes)
                .unwrap_or(true)
            {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                // 二进制或不可读文件直接跳过
                continue;
            };
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    hits.push(SearchHit {
                        path: rel.clone(),
                        line: idx + 1,
                        text: line.trim_end().to_string(),
                    });
                    if hits.len() >= self.section.max_results {
                        break 'outer;
                    }
                }
            }
        }
        Ok(hits)
    }
}

/// 命中列表渲染为 path:line:text 行
pub fn format_hits(hits: &[SearchHit], max_results: usize) -> String {
    if hits.is_empty() {
        return "(no matches)".to_string();
    }
    let mut out: String = hits
        .iter()
        .map(|h| format!("{}:{}:{}", h.path, h.line, h.text))
        .collect::<Vec<_>>()
        .join("\n");
    if hits.len() >= max_results {
        out.push_str("\n... (result limit reached)");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_search_finds_matches() {
        let dir = tempfile::Builder::new().prefix("loom").tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/lib.rs"),
            "fn alpha() {}\nfn beta() {}\n",
        )
        .unwrap();
        let provider = GrepSearch::new(SearchSection::default());
        let hits = provider
            .search(dir.path(), r"fn \w+", None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].line, 1);
        assert!(hits[0].path.ends_with("lib.rs"));
    }

    #[tokio::test]
    async fn test_invalid_regex_falls_back_to_literal() {
        let dir = tempfile::Builder::new().prefix("loom").tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "weird [pattern here\n").unwrap();
        let provider = GrepSearch::new(SearchSection::default());
        let hits = provider
            .search(dir.path(), "[pattern", None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_result_cap() {
        let dir = tempfile::Builder::new().prefix("loom").tempdir().unwrap();
        let body: String = (0..100).map(|i| format!("match {}\n", i)).collect();
        std::fs::write(dir.path().join("big.txt"), body).unwrap();
        let provider = GrepSearch::new(SearchSection {
            max_results: 10,
            ..SearchSection::default()
        });
        let hits = provider.search(dir.path(), "match", None).await.unwrap();
        assert_eq!(hits.len(), 10);
    }
}
