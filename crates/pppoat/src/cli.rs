//! 命令行解析与配置装配。

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser};
use pppoat_core::Conf;

pub const SERVER_KEY: &str = "server";
pub const CONFIG_KEY: &str = "config";
pub const HELP_KEY: &str = "help";

/// 服务端角色在未显式配置时使用的 pppd 地址对。
pub const SERVER_IP_PAIR: &str = "10.0.0.1:10.0.0.2";

#[derive(Parser, Debug)]
#[command(name = "pppoat", version, about = "PPP over Any Transport")]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// 以服务端角色运行
    #[arg(short, long)]
    pub server: bool,

    /// 配置文件路径，文件中的同名键覆盖命令行取值
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// 打印帮助
    #[arg(short, long)]
    pub help: bool,

    /// 模块配置项，形如 udp.host=192.168.1.2
    #[arg(value_name = "KEY=VALUE")]
    pub options: Vec<String>,
}

impl Cli {
    /// 把命令行写入配置，再读入配置文件（若有）。
    pub fn into_conf(self) -> Result<Conf> {
        let conf = Conf::new();
        if self.server {
            conf.store(SERVER_KEY, "");
        }
        if self.help {
            conf.store(HELP_KEY, "");
        }
        if let Some(path) = &self.config {
            conf.store(CONFIG_KEY, path.display().to_string());
        }
        conf.read_pairs(&self.options)
            .context("命令行配置项格式错误")?;
        if let Some(path) = conf.find_string(CONFIG_KEY) {
            conf.read_file(&path)
                .with_context(|| format!("无法加载配置文件 {path}"))?;
        }
        Ok(conf)
    }
}

/// 服务端角色的默认地址对，已显式配置时保持不变。
pub fn apply_server_role(conf: &Conf) -> bool {
    conf.find_bool(SERVER_KEY) && conf.store_default("pppd.ip", SERVER_IP_PAIR)
}

/// 解析未产出 [`Cli`] 时的退出码：`--version` 之类的信息输出以成功退出，参数错误以失败退出。
pub fn early_exit_code(err: &clap::Error) -> ExitCode {
    if err.use_stderr() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

pub fn print_help() {
    let mut command = Cli::command();
    if let Err(err) = command.print_long_help() {
        tracing::warn!(error = %err, "failed to print help");
    }
}

/// 启动时输出的用法提示。
pub fn usage_hints() -> [&'static str; 3] {
    [
        "服务端: pppoat -s udp.port=5000 udp.host=<客户端地址>",
        "客户端: pppoat udp.port=5000 udp.host=<服务端地址>",
        "文本帧: 追加 udp.base64=yes，两端需一致",
    ]
}
