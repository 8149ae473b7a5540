//! 轮次管理器
//!
//! 每条模型消息按固定顺序处理：目标一致性检查 -> diff 块短路 -> 结构化任务
//! 解析 -> 严格顺序执行 -> 逐任务生成结构化结果消息回填对话。diff 块与
//! 结构化任务在一轮内互斥；单个任务失败不中止批次。任务之间不并发——后面
//! 的任务可能依赖前面任务的文件系统副作用。

pub mod events;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use events::TurnEvent;

use crate::config::AppConfig;
use crate::core::TaskError;
use crate::executor::{Executor, Workspace};
use crate::parser::Parser;
use crate::patch;
use crate::task::{Task, TaskExecution, TaskResponse};

/// 目标一致性检查结果
pub struct ObjectiveCheck {
    pub consistent: bool,
    pub original: Option<String>,
    pub detected: Option<String>,
}

/// 目标一致性校验协作者：检测模型是否中途改写了既定目标
#[async_trait]
pub trait ObjectiveValidator: Send + Sync {
    async fn validate(&self, message: &str) -> ObjectiveCheck;
}

/// 默认实现：不跟踪目标，一律放行
pub struct AcceptAllObjectives;

#[async_trait]
impl ObjectiveValidator for AcceptAllObjectives {
    async fn validate(&self, _message: &str) -> ObjectiveCheck {
        ObjectiveCheck {
            consistent: true,
            original: None,
            detected: None,
        }
    }
}

/// 一轮的处理类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// 目标漂移：短路，未解析任何任务
    ObjectiveDrift,
    /// diff 块批次
    DiffBlocks,
    /// 结构化任务批次
    Tasks,
    /// 普通聊天回复，无事可做
    Chat,
}

/// 一轮处理的产物
#[derive(Debug)]
pub struct TurnOutcome {
    pub kind: TurnKind,
    /// 执行记录；Chat / ObjectiveDrift 轮没有
    pub execution: Option<TaskExecution>,
    /// 面向模型的逐任务结构化结果消息
    pub result_messages: Vec<String>,
    /// 面向用户的一行状态
    pub user_lines: Vec<String>,
    /// 目标漂移时要求宿主自动续一轮纠偏
    pub auto_continue: bool,
    /// 当前策略恒为 false：编辑在 prepare 成功后即刻落盘，没有待确认态
    pub requires_confirmation: bool,
}

impl TurnOutcome {
    fn chat() -> Self {
        Self {
            kind: TurnKind::Chat,
            execution: None,
            result_messages: Vec::new(),
            user_lines: Vec::new(),
            auto_continue: false,
            requires_confirmation: false,
        }
    }
}

/// 轮次管理器：持有解析器、执行器与协作者
pub struct Manager {
    parser: Parser,
    executor: Executor,
    objective: Arc<dyn ObjectiveValidator>,
    event_tx: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl Manager {
    /// 按配置组装：工作区目录不存在时创建
    pub fn new(config: &AppConfig) -> std::io::Result<Self> {
        let root: PathBuf = config
            .app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"));
        std::fs::create_dir_all(&root)?;
        let workspace = Workspace::new(&root);
        let executor = Executor::new(workspace, config.tools.clone());
        Ok(Self::from_parts(
            Parser::new(config.tools.shell.timeout_secs),
            executor,
        ))
    }

    pub fn from_parts(parser: Parser, executor: Executor) -> Self {
        Self {
            parser,
            executor,
            objective: Arc::new(AcceptAllObjectives),
            event_tx: None,
        }
    }

    pub fn with_objective_validator(mut self, validator: Arc<dyn ObjectiveValidator>) -> Self {
        self.objective = validator;
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// 处理一条模型消息（一轮）
    pub async fn process_message(&self, text: &str) -> Result<TurnOutcome, TaskError> {
        // 1. 目标一致性：漂移则短路，本轮不解析任务
        let check = self.objective.validate(text).await;
        if !check.consistent {
            let original = check.original.unwrap_or_default();
            let detected = check.detected.unwrap_or_default();
            self.send_event(TurnEvent::ObjectiveDrift {
                original: original.clone(),
                detected: detected.clone(),
            });
            let correction = format!(
                "Objective drift detected: the declared goal changed from '{}' to '{}'. \
                 Stay on the original objective; no tasks were executed this turn.",
                original, detected
            );
            return Ok(TurnOutcome {
                kind: TurnKind::ObjectiveDrift,
                execution: None,
                result_messages: vec![correction.clone()],
                user_lines: vec![correction],
                auto_continue: true,
                requires_confirmation: false,
            });
        }

        // 2. diff 块短路：与结构化任务互斥，出现即为本轮全部内容
        if patch::contains_blocks(text) {
            let blocks = patch::parse_blocks(text)?;
            let tasks: Vec<Task> = blocks
                .into_iter()
                .map(|b| Task::EditFile {
                    path: b.dest_path,
                    diff: None,
                    diff_block: Some(b.raw),
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
                })
                .collect();
            return Ok(self.run_batch(TurnKind::DiffBlocks, tasks).await);
        }

        // 3. 结构化任务解析；零任务 = 普通聊天轮
        let Some(tasks) = self.parser.parse(text)? else {
            return Ok(TurnOutcome::chat());
        };

        // 4+5. 顺序执行并生成结果消息
        Ok(self.run_batch(TurnKind::Tasks, tasks).await)
    }

    /// 按声明顺序逐个执行；失败不短路后续任务
    async fn run_batch(&self, kind: TurnKind, tasks: Vec<Task>) -> TurnOutcome {
        let total = tasks.len();
        let mut execution = TaskExecution::new(tasks.clone());
        let mut result_messages = Vec::with_capacity(total);
        let mut user_lines = Vec::with_capacity(total);
        let mut failed = 0usize;

        for (index, task) in tasks.into_iter().enumerate() {
            self.send_event(TurnEvent::TaskStarted {
                index,
                total,
                task_type: task.type_name().to_string(),
                arg: task.key_arg().to_string(),
            });

            let response = self.executor.execute(task).await;

            if response.success {
                self.send_event(TurnEvent::TaskCompleted {
                    index,
                    output: response.output.clone(),
                });
            } else {
                failed += 1;
                self.send_event(TurnEvent::TaskFailed {
                    index,
                    error: response.error.clone().unwrap_or_default(),
                });
            }

            // 结果消息回填对话，让下一轮拿到的是真实状态而不是模型的推断
            result_messages.push(format_result_message(index, total, &response));
            user_lines.push(response.output.clone());
            execution.record(response);
        }

        execution.close();
        self.send_event(TurnEvent::TurnCompleted {
            execution_id: execution.id.clone(),
            total,
            failed,
        });

        TurnOutcome {
            kind,
            execution: Some(execution),
            result_messages,
            user_lines,
            auto_continue: false,
            requires_confirmation: false,
        }
    }

    fn send_event(&self, event: TurnEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

/// 面向模型的结构化结果消息：状态行 + 内容/预览段 + 错误段
fn format_result_message(index: usize, total: usize, response: &TaskResponse) -> String {
    let status = if response.success { "ok" } else { "failed" };
    let mut out = format!(
        "[task {}/{}] {} {} -> {}\n{}\n",
        index + 1,
        total,
        response.task.type_name(),
        response.task.key_arg(),
        status,
        response.output
    );
    if let Some(content) = &response.actual_content {
        if !content.is_empty() {
            out.push_str("--- content ---\n");
            out.push_str(content);
            if !content.ends_with('\n') {
                out.push('\n');
            }
        }
    }
    if let Some(error) = &response.error {
        out.push_str("--- error ---\n");
        out.push_str(error);
        out.push('\n');
        if let Some(hint) = &response.contextual_error {
            out.push_str(&format!("hint: {}\n", hint));
        }
    }
    out
}
