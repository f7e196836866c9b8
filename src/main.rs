//! account-polld CLI
//!
//! 轮询在线账户与 poller helper，把新消息转为桌面通知

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use account_polld::{daemon, list_pollers, AuthData, Daemon, DaemonConfig, OutboxStore};

#[derive(Parser)]
#[command(name = "account-polld")]
#[command(about = "account-polld - 轮询在线账户并投递通知")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 前台运行守护进程
    Run {
        /// 只打印通知，不写入发件箱
        #[arg(long)]
        dry_run: bool,
        /// 账户认证数据文件（每行一个 JSON 格式的 AuthData）
        #[arg(long)]
        accounts: Option<PathBuf>,
    },
    /// 列出已发现的 poller
    Pollers {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 打印生效的配置
    Config,
    /// 查看发件箱中的通知
    Outbox {
        /// 只显示指定应用
        #[arg(long)]
        app: Option<String>,
        /// 清除指定应用的记录（需要 --app）
        #[arg(long, requires = "app")]
        clear: bool,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，例如: RUST_LOG=debug account-polld run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("account_polld=info,account-polld=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = DaemonConfig::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Run { dry_run, accounts } => {
            let (auth_tx, auth_rx) = mpsc::channel(16);
            if let Some(path) = accounts {
                let records = read_accounts(&path).await?;
                info!(accounts = records.len(), path = %path.display(), "Loaded account data");
                tokio::spawn(async move {
                    for auth in records {
                        if auth_tx.send(auth).await.is_err() {
                            break;
                        }
                    }
                });
            } else {
                drop(auth_tx);
            }

            let shutdown = CancellationToken::new();
            tokio::spawn(daemon::wait_for_shutdown_signal(shutdown.clone()));

            Daemon::new(config)
                .with_dry_run(dry_run)
                .run(auth_rx, shutdown)
                .await?;
        }
        Commands::Pollers { json } => {
            let pollers = list_pollers(&config.pollers_dir);
            if json {
                println!("{}", serde_json::to_string_pretty(&pollers)?);
            } else {
                println!("发现 {} 个 poller ({}):\n", pollers.len(), config.pollers_dir.display());
                for poller in pollers {
                    println!("  {} | {}", poller.app_id, poller.exec);
                }
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Outbox { app, clear, json } => {
            let store = OutboxStore::new(&config.outbox_path);
            if clear {
                if let Some(app) = &app {
                    store.clear_app(app)?;
                    println!("已清除 {} 的通知记录", app);
                }
                return Ok(());
            }

            let records = match &app {
                Some(app) => store.records_for(app),
                None => store.read_all(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("共 {} 条通知:\n", records.len());
                for r in records {
                    let card = if r.has_card { "card" } else { "alert" };
                    println!("  {} | {} | {} | {}", r.ts.format("%Y-%m-%d %H:%M:%S"), r.app_id, r.tag, card);
                }
            }
        }
    }

    Ok(())
}

/// 读取账户文件，无法解析的行跳过
async fn read_accounts(path: &Path) -> Result<Vec<AuthData>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut records = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuthData>(line) {
            Ok(auth) => records.push(auth),
            Err(e) => warn!(line = n + 1, error = %e, "Skipping invalid account record"),
        }
    }
    Ok(records)
}
