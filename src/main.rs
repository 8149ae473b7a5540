//! Loom - 执行核心演示入口
//!
//! 从文件参数（或 stdin）读入一条模型回复，对配置的工作区跑一轮完整管线，
//! 打印用户侧状态行与回填给模型的结构化结果消息。

use std::io::Read;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let config = loom::config::load_config(None).context("Failed to load config")?;
    let manager = loom::Manager::new(&config).context("Failed to set up workspace")?;

    let text = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read message file '{}'", path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read message from stdin")?;
            buf
        }
    };

    let outcome = manager
        .process_message(&text)
        .await
        .context("Turn processing failed")?;

    match outcome.kind {
        loom::TurnKind::Chat => println!("(ordinary reply, nothing to execute)"),
        _ => {
            for line in &outcome.user_lines {
                println!("{}", line);
            }
            println!();
            for message in &outcome.result_messages {
                println!("{}", message);
            }
        }
    }

    if let Some(execution) = &outcome.execution {
        let failed = execution.responses.iter().filter(|r| !r.success).count();
        println!(
            "execution {}: {} task(s), {} failed, status {}",
            execution.id,
            execution.tasks.len(),
            failed,
            execution.status
        );
    }

    Ok(())
}
