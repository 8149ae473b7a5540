//! 沙箱工作区
//!
//! Workspace 绑定根目录，所有路径先做词法规范化（../ 向上越界直接拒绝），
//! 存在的路径再经 canonicalize 复核（symlink 逃逸），确认在根下才允许任何
//! 文件系统调用。写入走「确保父目录 + 可选 .bak 备份」的老路。

use std::path::{Component, Path, PathBuf};

use crate::core::TaskError;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析工作区相对路径；目标可以不存在（供写入新文件用）
    ///
    /// 任何越出根目录的路径返回 Security 错误，且发生在一切 I/O 之前。
    pub fn resolve(&self, path: &str) -> Result<PathBuf, TaskError> {
        let raw = Path::new(path.trim());
        if raw.as_os_str().is_empty() {
            return Err(TaskError::Validation("empty path".to_string()));
        }

        // 绝对路径只在已经位于根下时接受
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.root.join(raw)
        };

        // 词法规范化：.. 不得越过根
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(TaskError::Security(path.to_string()));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(TaskError::Security(path.to_string()));
        }

        // 存在的路径复核 canonical 形态，拦截 symlink 逃逸
        if normalized.exists() {
            let canonical = normalized
                .canonicalize()
                .map_err(|e| TaskError::Apply(format!("cannot resolve '{}': {}", path, e)))?;
            if !canonical.starts_with(&self.root) {
                return Err(TaskError::Security(path.to_string()));
            }
            return Ok(canonical);
        }
        Ok(normalized)
    }

    /// 读取文件文本；文件必须已在 resolve 通过
    pub fn read_to_string(&self, resolved: &Path) -> Result<String, TaskError> {
        std::fs::read_to_string(resolved)
            .map_err(|e| TaskError::Apply(format!("read failed for '{}': {}", resolved.display(), e)))
    }

    /// 写入文件；自动创建父目录，backup=true 时对已有文件先留 .bak
    pub fn write(&self, resolved: &Path, content: &str, backup: bool) -> Result<(), TaskError> {
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TaskError::Apply(format!("failed to create parent directory: {}", e))
            })?;
        }
        if backup && resolved.exists() {
            let backup_path = resolved.with_extension("bak");
            std::fs::copy(resolved, &backup_path)
                .map_err(|e| TaskError::Apply(format!("failed to create backup: {}", e)))?;
        }
        std::fs::write(resolved, content)
            .map_err(|e| TaskError::Apply(format!("write failed for '{}': {}", resolved.display(), e)))
    }

    /// 工作区相对显示路径（日志与结果消息用）
    pub fn display_path(&self, resolved: &Path) -> String {
        resolved
            .strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| resolved.display().to_string())
    }
}
