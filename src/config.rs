//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LOOM__*` 覆盖（双下划线表示嵌套，
//! 如 `LOOM__TOOLS__SHELL__ENABLED=true`）。配置对象在入口构造后按引用传递，
//! 不使用进程级可变单例。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：工作区根目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [tools] 段：各任务类型的限额与开关
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// patch 等子进程的统一超时（秒）
    #[serde(default = "default_subprocess_timeout_secs")]
    pub subprocess_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub read: ReadSection,
    #[serde(default)]
    pub list: ListSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub edit: EditSection,
}

fn default_subprocess_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            subprocess_timeout_secs: default_subprocess_timeout_secs(),
            shell: ShellSection::default(),
            read: ReadSection::default(),
            list: ListSection::default(),
            search: SearchSection::default(),
            edit: EditSection::default(),
        }
    }
}

/// [tools.shell] 段：默认关闭，开启后仍受白名单与禁用子串约束
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    /// 未显式开启时 RunShell 一律拒绝
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_shell_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_shell_timeout_secs(),
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_shell_timeout_secs() -> u64 {
    30
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "cargo".into(),
        "rustc".into(),
        "git".into(),
    ]
}

/// [tools.read] 段：读取窗口与大小上限
#[derive(Debug, Clone, Deserialize)]
pub struct ReadSection {
    /// 未指定行范围时一次最多返回的行数
    #[serde(default = "default_read_max_lines")]
    pub max_lines: usize,
    /// 超过此字节数的文件直接拒绝
    #[serde(default = "default_read_max_bytes")]
    pub max_bytes: u64,
}

impl Default for ReadSection {
    fn default() -> Self {
        Self {
            max_lines: default_read_max_lines(),
            max_bytes: default_read_max_bytes(),
        }
    }
}

fn default_read_max_lines() -> usize {
    200
}

fn default_read_max_bytes() -> u64 {
    2 * 1024 * 1024
}

/// [tools.list] 段：目录列举限额与忽略模式
#[derive(Debug, Clone, Deserialize)]
pub struct ListSection {
    #[serde(default = "default_list_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_list_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_list_max_output_bytes")]
    pub max_output_bytes: usize,
    /// 额外忽略的 glob 模式（隐藏目录、target、node_modules 始终忽略）
    #[serde(default)]
    pub ignore_globs: Vec<String>,
}

impl Default for ListSection {
    fn default() -> Self {
        Self {
            max_entries: default_list_max_entries(),
            max_depth: default_list_max_depth(),
            max_output_bytes: default_list_max_output_bytes(),
            ignore_globs: Vec::new(),
        }
    }
}

fn default_list_max_entries() -> usize {
    500
}

fn default_list_max_depth() -> usize {
    8
}

fn default_list_max_output_bytes() -> usize {
    64 * 1024
}

/// [tools.search] 段：结果条数与单文件大小上限
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            max_results: default_search_max_results(),
            max_file_bytes: default_search_max_file_bytes(),
        }
    }
}

fn default_search_max_results() -> usize {
    50
}

fn default_search_max_file_bytes() -> u64 {
    1024 * 1024
}

/// [tools.edit] 段：编辑引擎限额与备份开关
#[derive(Debug, Clone, Deserialize)]
pub struct EditSection {
    /// 写入前是否生成 .bak 备份
    #[serde(default)]
    pub backup_enabled: bool,
    #[serde(default = "default_edit_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for EditSection {
    fn default() -> Self {
        Self {
            backup_enabled: false,
            max_file_bytes: default_edit_max_file_bytes(),
        }
    }
}

fn default_edit_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

/// 从 config 目录加载配置，环境变量 LOOM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LOOM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LOOM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
