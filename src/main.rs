use clap::{Parser, Subcommand};
use modelsync_lib::commands;
use modelsync_lib::core::{AssetKey, JobKind, JobSnapshot, SyncError};
use modelsync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use modelsync_lib::AppState;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "modelsync", version, about = "模型文件本地缓存与网络存储同步工具")]
struct Cli {
    /// 分类配置文件（默认读取数据目录下的 categories.yaml）
    #[arg(long, global = true)]
    categories: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 匹配候选字符串并报告两端状态
    Scan {
        #[arg(required = true)]
        candidates: Vec<String>,
    },
    /// 列出本地缓存
    List,
    /// 从网络端复制到本地
    Localize {
        /// `category/relative/path`
        #[arg(required = true)]
        keys: Vec<String>,
        #[arg(long)]
        overwrite: bool,
    },
    /// 从本地复制到网络端
    Upload {
        #[arg(required = true)]
        keys: Vec<String>,
        #[arg(long)]
        overwrite: bool,
    },
    /// 删除本地缓存文件
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// 查看或修改清理设置
    Settings {
        #[arg(long)]
        auto_delete: Option<bool>,
        #[arg(long)]
        max_cache_bytes: Option<u64>,
    },
    /// 立即清理本地缓存
    Prune {
        /// 仅本次生效的缓存上限
        #[arg(long)]
        max_cache_bytes: Option<u64>,
    },
    /// 查看操作日志
    Log,
    /// 查看或修改日志配置
    LogConfig {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        max_size_mb: Option<u32>,
        #[arg(long)]
        level: Option<String>,
    },
}

/// 初始化日志系统
fn init_logging() -> Option<WorkerGuard> {
    let log_dir = get_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let config = LogConfig::load(&log_dir);

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy()
        .add_directive("sqlx=warn".parse().ok()?);

    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let (writer, guard) = tracing_appender::non_blocking(file_writer);
            // 文件日志层 - 始终输出到文件
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);

            // 在 debug 模式下也输出到 stderr，stdout 留给 JSON 输出
            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false);
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            #[cfg(not(debug_assertions))]
            {
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到 stderr
            eprintln!("无法创建日志文件: {}", e);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_keys(raw: &[String]) -> Result<Vec<AssetKey>, SyncError> {
    raw.iter().map(|k| AssetKey::parse(k)).collect()
}

/// 在前台运行任务直到结束，Ctrl-C 请求取消
async fn run_job(
    state: &AppState,
    kind: JobKind,
    keys: &[String],
    overwrite: bool,
) -> Result<JobSnapshot, SyncError> {
    let keys = parse_keys(keys)?;
    let started = commands::job::start_job(state, kind, keys, overwrite).await?;
    let job_id = started.job_id;

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                eprintln!("\n正在取消任务 {} ...", job_id);
                cancel_sent = true;
                // 任务可能恰好已经结束
                let _ = commands::job::cancel_job(state, &job_id);
            }
        }

        let snapshot = commands::job::poll_job(state, &job_id)?;
        let current = snapshot
            .current_key
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_default();
        eprint!("\r{:>5.1}% {:<60}", snapshot.percent, current);
        if snapshot.state.is_terminal() {
            eprintln!();
            return Ok(snapshot);
        }
    }
}

async fn execute(state: &AppState, command: Command) -> anyhow::Result<Result<(), SyncError>> {
    let outcome = match command {
        Command::Scan { candidates } => match commands::scan::scan(state, &candidates).await {
            Ok(response) => print_json(&response).map(Ok)?,
            Err(e) => Err(e),
        },
        Command::List => match commands::scan::list_local(state).await {
            Ok(response) => print_json(&response).map(Ok)?,
            Err(e) => Err(e),
        },
        Command::Localize { keys, overwrite } => {
            match run_job(state, JobKind::Localize, &keys, overwrite).await {
                Ok(snapshot) => print_json(&snapshot).map(Ok)?,
                Err(e) => Err(e),
            }
        }
        Command::Upload { keys, overwrite } => {
            match run_job(state, JobKind::Upload, &keys, overwrite).await {
                Ok(snapshot) => print_json(&snapshot).map(Ok)?,
                Err(e) => Err(e),
            }
        }
        Command::Delete { keys } => match parse_keys(&keys) {
            Ok(keys) => {
                let results = commands::cache::delete_local_batch(state, keys).await;
                print_json(&results)?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Settings {
            auto_delete,
            max_cache_bytes,
        } => {
            let result = if auto_delete.is_none() && max_cache_bytes.is_none() {
                Ok(commands::cache::get_settings(state))
            } else {
                commands::cache::set_settings(state, auto_delete, max_cache_bytes)
            };
            match result {
                Ok(settings) => print_json(&settings).map(Ok)?,
                Err(e) => Err(e),
            }
        }
        Command::Prune { max_cache_bytes } => {
            match commands::cache::prune_now(state, max_cache_bytes).await {
                Ok(entries) => print_json(&entries).map(Ok)?,
                Err(e) => Err(e),
            }
        }
        Command::Log => match commands::cache::get_prune_log(state).await {
            Ok(text) => {
                println!("{}", text);
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::LogConfig {
            enabled,
            max_size_mb,
            level,
        } => {
            let result = if enabled.is_none() && max_size_mb.is_none() && level.is_none() {
                Ok(commands::log::get_log_config(state))
            } else {
                commands::log::set_log_config(state, enabled, max_size_mb, level.as_deref())
            };
            match result {
                Ok(config) => print_json(&config).map(Ok)?,
                Err(e) => Err(e),
            }
        }
    };
    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    // guard 必须存活到退出，否则缓冲中的日志会丢失
    let _log_guard = init_logging();

    let state = match AppState::new(cli.categories).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("初始化失败: {:#}", e);
            eprintln!("初始化失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = execute(&state, cli.command).await;
    state.cleanup().await;

    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!("{}", e);
            eprintln!(
                "{}",
                serde_json::to_string(&e).unwrap_or_else(|_| e.to_string())
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
