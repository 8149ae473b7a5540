//! Shell 执行
//!
//! 仅在配置显式开启时可用；命令首词须在白名单内，禁止危险子串；硬超时
//! 强制终止子进程。stdout/stderr 分开捕获，超时与非零退出是两种失败。

use std::process::Stdio;

use tokio::process::Command;

use crate::config::ShellSection;
use crate::core::TaskError;
use crate::executor::workspace::Workspace;

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 子进程结果：退出码与两路输出
#[derive(Debug)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn check_allowed(section: &ShellSection, command: &str) -> Result<(), TaskError> {
    if !section.enabled {
        return Err(TaskError::Validation(
            "shell execution is disabled by configuration (tools.shell.enabled)".to_string(),
        ));
    }
    let lower = command.to_lowercase();
    for forbidden in FORBIDDEN_SUBSTR {
        if lower.contains(forbidden) {
            return Err(TaskError::Validation(format!(
                "forbidden pattern in command: {}",
                forbidden
            )));
        }
    }
    let name = lower.split_whitespace().next().unwrap_or("");
    if name.is_empty() {
        return Err(TaskError::Validation("empty command".to_string()));
    }
    if !section
        .allowed_commands
        .iter()
        .any(|c| c.to_lowercase() == name)
    {
        return Err(TaskError::Validation(format!(
            "command '{}' not in allowlist",
            name
        )));
    }
    Ok(())
}

/// 执行命令；超时返回 ShellTimeout 并杀死子进程，非零退出在 ShellOutput 中体现
pub async fn run_shell(
    ws: &Workspace,
    section: &ShellSection,
    command: &str,
    timeout_secs: u64,
    cwd: Option<&str>,
) -> Result<ShellOutput, TaskError> {
    check_allowed(section, command)?;

    let work_dir = match cwd {
        Some(p) => ws.resolve(p)?,
        None => ws.root().to_path_buf(),
    };

    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.current_dir(&work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::info!(command = %command, cwd = %work_dir.display(), "shell execute");

    let child = cmd
        .spawn()
        .map_err(|e| TaskError::Apply(format!("failed to spawn shell: {}", e)))?;

    // 超时丢弃 future，kill_on_drop 负责终止子进程
    let output = tokio::time::timeout(
        std::time::Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| TaskError::ShellTimeout(timeout_secs))?
    .map_err(|e| TaskError::Apply(format!("shell wait failed: {}", e)))?;

    Ok(ShellOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_section() -> ShellSection {
        ShellSection {
            enabled: true,
            timeout_secs: 5,
            allowed_commands: vec!["echo".into(), "sleep".into(), "sh".into(), "false".into()],
        }
    }

    #[tokio::test]
    async fn test_disabled_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let err = run_shell(&ws, &ShellSection::default(), "echo hi", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[tokio::test]
    async fn test_captures_stdout_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let out = run_shell(
            &ws,
            &enabled_section(),
            "echo out; echo err >&2",
            5,
            None,
        )
        .await
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let out = run_shell(&ws, &enabled_section(), "false", 5, None)
            .await
            .unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let err = run_shell(&ws, &enabled_section(), "sleep 30", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ShellTimeout(1)));
    }

    #[tokio::test]
    async fn test_forbidden_substring() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let err = run_shell(&ws, &enabled_section(), "echo x && rm -rf /", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }
}
