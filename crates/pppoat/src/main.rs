//! pppoat 命令行入口：装配配置、启动隧道、等待停机信号后拆除。

#[cfg(not(unix))]
compile_error!("pppoat 依赖 Unix 信号与 pppd，仅支持类 Unix 平台");

mod cli;
mod registry;

use std::process::ExitCode;

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;
use pppoat_core::{Context, ModuleKind, ShutdownCoordinator, Tunnel, logging, shutdown};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = logging::install("debug") {
        eprintln!("pppoat: 无法初始化日志: {err}");
        return ExitCode::FAILURE;
    }
    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    for hint in cli::usage_hints() {
        tracing::info!("{hint}");
    }

    shutdown::ignore_broken_pipe().context("无法忽略 SIGPIPE")?;
    let coordinator = ShutdownCoordinator::new();
    let bridge = coordinator
        .install_signal_bridge()
        .context("无法安装信号处理")?;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return Ok(cli::early_exit_code(&err));
        }
    };
    let conf = cli.into_conf()?;
    conf.dump();
    logging::reconfigure(&conf).context("日志级别配置无效")?;

    if conf.find_bool(cli::HELP_KEY) {
        cli::print_help();
        println!("\n内置驱动:");
        for (name, kind) in registry::builtin() {
            println!("  {name:<8}{kind}");
        }
        return Ok(ExitCode::SUCCESS);
    }
    if cli::apply_server_role(&conf) {
        tracing::info!(ip = cli::SERVER_IP_PAIR, "server role, default pppd address pair");
    }

    let interface = registry::select(&conf, ModuleKind::Interface)
        .map_err(|name| anyhow!("未知的接口驱动 `{name}`"))?;
    let transport = registry::select(&conf, ModuleKind::Transport)
        .map_err(|name| anyhow!("未知的传输驱动 `{name}`"))?;

    let ctx = Context::new(conf, coordinator.trigger()).context("上下文初始化失败")?;
    let tunnel = Tunnel::start(&ctx, &[interface.as_ref(), transport.as_ref()])
        .await
        .context("隧道启动失败")?;

    coordinator.wait().await;
    if let Err(err) = bridge.restore_defaults() {
        tracing::warn!(error = %err, "failed to restore default signal disposition");
    }

    let report = tunnel.shutdown().await;
    if !report.is_clean() {
        tracing::warn!(modules = ?report.modules, "modules left unfinalized");
    }
    Ok(ExitCode::SUCCESS)
}
