#![doc = r#"
# pppoat-if-pppd

## 模块使命（Why）
- 以 `nodetach notty` 模式拉起 pppd，把它的标准输出作为链路层帧的来源、标准输入作为去处，
  使任意传输模块都能承载一条完整的 PPP 会话。

## 核心契约（What）
- 配置键：`pppd.path`（默认 `/usr/sbin/pppd`）、`pppd.ip`（`本端:对端`，可选）、
  `pppd.mtu`（单次读取上限，默认 1500）、`pppd.args`（附加选项，以空白分隔）；
- 子进程退出即视为接口故障，工作任务返回错误并触发整体停机；
- 写入 stdin 与读取 stdout 在同一个 `select!` 中交替推进，子进程暂不读取输入时输出仍被持续取走；
  输出交给邻居时不等待，邻居队列已满则丢弃该段；
- `stop` 终止并回收子进程，不遗留僵尸进程。
"#]

use std::{
    net::Ipv4Addr,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use async_trait::async_trait;
use pppoat_core::{
    Conf, Driver, DriverFactory, Error as CoreError, ModuleIo, ModuleKind, Packet,
    Result as CoreResult,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, ChildStdout, Command},
};

/// 驱动名，同时是 `pipeline.interface` 的取值。
pub const NAME: &str = "pppd";

pub const PATH_KEY: &str = "pppd.path";
pub const IP_KEY: &str = "pppd.ip";
pub const MTU_KEY: &str = "pppd.mtu";
pub const ARGS_KEY: &str = "pppd.args";

pub const DEFAULT_PATH: &str = "/usr/sbin/pppd";
pub const DEFAULT_MTU: usize = 1500;

/// pppd 拉起 PPP 会话时始终携带的选项。
const BASE_ARGS: [&str; 3] = ["nodetach", "notty", "noauth"];

/// pppd 驱动的错误。
#[derive(Debug, Error)]
pub enum PppdError {
    /// 配置项取值非法。
    #[error("配置项 {key} 的取值 `{value}` 非法")]
    InvalidValue { key: &'static str, value: String },
    /// 子进程无法启动。
    #[error("无法启动 {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 子进程缺少标准输入或输出管道。
    #[error("子进程缺少 {0} 管道")]
    MissingPipe(&'static str),
    /// 读取子进程输出失败。
    #[error("读取 pppd 输出失败: {0}")]
    Read(#[source] std::io::Error),
    /// 写入子进程输入失败。
    #[error("写入 pppd 输入失败: {0}")]
    Write(#[source] std::io::Error),
    /// 子进程已退出。
    #[error("pppd 已退出: {0}")]
    Exited(String),
}

impl From<PppdError> for CoreError {
    fn from(err: PppdError) -> Self {
        match err {
            PppdError::InvalidValue { .. } => CoreError::init(NAME, err.to_string()),
            PppdError::Spawn { .. } | PppdError::MissingPipe(_) => CoreError::start(NAME, err),
            PppdError::Read(source) | PppdError::Write(source) => CoreError::Io(source),
            PppdError::Exited(_) => CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                err.to_string(),
            )),
        }
    }
}

/// pppd 子进程的启动参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PppdConfig {
    pub path: PathBuf,
    pub ip: Option<String>,
    pub mtu: usize,
    pub extra: Vec<String>,
}

impl PppdConfig {
    pub fn from_conf(conf: &Conf) -> Result<Self, PppdError> {
        let path = conf
            .find_string(PATH_KEY)
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_owned());
        let ip = conf
            .find_string(IP_KEY)
            .map(|ip| ip.trim().to_owned())
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = &ip {
            validate_ip_pair(ip)?;
        }
        let mtu = match conf.find_parsed::<usize>(MTU_KEY) {
            Ok(Some(0)) | Err(_) => {
                return Err(PppdError::InvalidValue {
                    key: MTU_KEY,
                    value: conf.find_string(MTU_KEY).unwrap_or_default(),
                });
            }
            Ok(value) => value.unwrap_or(DEFAULT_MTU),
        };
        let extra = conf
            .find_string(ARGS_KEY)
            .map(|args| args.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        Ok(Self {
            path: PathBuf::from(path.trim()),
            ip,
            mtu,
            extra,
        })
    }

    /// 子进程的完整参数列表：固定选项、地址对、附加选项。
    pub fn command_args(&self) -> Vec<String> {
        BASE_ARGS
            .iter()
            .map(|arg| (*arg).to_owned())
            .chain(self.ip.clone())
            .chain(self.extra.iter().cloned())
            .collect()
    }
}

/// `本端:对端`，两侧都可省略，但不能同时省略。
fn validate_ip_pair(pair: &str) -> Result<(), PppdError> {
    let invalid = || PppdError::InvalidValue {
        key: IP_KEY,
        value: pair.to_owned(),
    };
    let (local, remote) = pair.split_once(':').ok_or_else(invalid)?;
    if local.is_empty() && remote.is_empty() {
        return Err(invalid());
    }
    for side in [local, remote] {
        if !side.is_empty() && side.parse::<Ipv4Addr>().is_err() {
            return Err(invalid());
        }
    }
    Ok(())
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("退出码 {code}"),
        None => "被信号终止".to_owned(),
    }
}

fn unwritten(pending: &Option<(Packet, usize)>) -> &[u8] {
    pending
        .as_ref()
        .map_or(&[][..], |(packet, offset)| &packet.as_slice()[*offset..])
}

/// 把一段子进程输出交给邻居；报文池耗尽或邻居队列已满时丢弃，不阻塞工作循环。
async fn emit_chunk(io: &ModuleIo, data: &[u8]) -> CoreResult<()> {
    let packet = match io.alloc_from(data) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::warn!(error = %err, len = data.len(), "no packet available, chunk dropped");
            return Ok(());
        }
    };
    if let Some(packet) = io.try_emit(packet).await? {
        tracing::warn!(len = packet.len(), "neighbour queue full, chunk dropped");
    }
    Ok(())
}

/// pppd 接口驱动。
pub struct PppdInterface {
    config: PppdConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl PppdInterface {
    pub fn new(config: PppdConfig) -> Self {
        Self {
            config,
            child: None,
            stdin: None,
            stdout: None,
        }
    }

    pub fn config(&self) -> &PppdConfig {
        &self.config
    }

    /// 子进程的 pid；未启动或已回收时为 `None`。
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn spawn(&self) -> Result<Child, PppdError> {
        Command::new(&self.config.path)
            .args(self.config.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PppdError::Spawn {
                path: self.config.path.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl Driver for PppdInterface {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Interface
    }

    async fn start(&mut self) -> CoreResult<()> {
        let mut child = self.spawn()?;
        let stdin = child.stdin.take().ok_or(PppdError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(PppdError::MissingPipe("stdout"))?;
        tracing::info!(
            path = %self.config.path.display(),
            args = ?self.config.command_args(),
            pid = child.id(),
            "pppd spawned"
        );
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.stdout = Some(stdout);
        Ok(())
    }

    async fn serve(&mut self, io: &ModuleIo) -> CoreResult<()> {
        let Self {
            config,
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(stdout),
        } = self
        else {
            return Err(CoreError::Closed);
        };
        let mut chunk = vec![0u8; config.mtu];
        // 尚未完整写入 stdin 的报文及已写入的字节数。
        let mut pending: Option<(Packet, usize)> = None;
        loop {
            tokio::select! {
                _ = io.stopped() => return Ok(()),
                inbound = io.recv(), if pending.is_none() => {
                    let packet = inbound?;
                    if !packet.is_empty() {
                        pending = Some((packet, 0));
                    }
                }
                written = stdin.write(unwritten(&pending)), if pending.is_some() => {
                    let written = written.map_err(PppdError::Write)?;
                    if written == 0 {
                        return Err(PppdError::Exited("标准输入已关闭".to_owned()).into());
                    }
                    if let Some((packet, offset)) = pending.as_mut() {
                        *offset += written;
                        if *offset >= packet.len() {
                            pending = None;
                        }
                    }
                }
                read = stdout.read(&mut chunk) => {
                    match read.map_err(PppdError::Read)? {
                        0 => return Err(PppdError::Exited("标准输出已关闭".to_owned()).into()),
                        len => emit_chunk(io, &chunk[..len]).await?,
                    }
                }
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => describe(status),
                        Err(err) => err.to_string(),
                    };
                    return Err(PppdError::Exited(reason).into());
                }
            }
        }
    }

    async fn stop(&mut self) -> CoreResult<()> {
        self.stdin = None;
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Err(err) = child.start_kill() {
            tracing::debug!(error = %err, "pppd already gone");
        }
        let status = child.wait().await?;
        tracing::info!(status = %describe(status), "pppd reaped");
        Ok(())
    }
}

/// pppd 驱动工厂。
#[derive(Clone, Copy, Debug, Default)]
pub struct PppdFactory;

impl DriverFactory for PppdFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Interface
    }

    fn init(&self, conf: &Conf) -> CoreResult<Box<dyn Driver>> {
        let config = PppdConfig::from_conf(conf)?;
        tracing::debug!(?config, "pppd interface configured");
        Ok(Box::new(PppdInterface::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(pairs: &[&str]) -> Conf {
        let conf = Conf::new();
        conf.read_pairs(pairs).expect("测试参数格式正确");
        conf
    }

    #[test]
    fn defaults_without_keys() {
        let config = PppdConfig::from_conf(&Conf::new()).expect("空配置可用默认值");
        assert_eq!(config.path, PathBuf::from(DEFAULT_PATH));
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.command_args(), ["nodetach", "notty", "noauth"]);
    }

    #[test]
    fn args_include_ip_pair_and_extras() {
        let config = PppdConfig::from_conf(&conf(&[
            "pppd.ip=10.0.0.1:10.0.0.2",
            "pppd.args=debug  lcp-echo-interval 10",
        ]))
        .expect("合法配置");
        assert_eq!(
            config.command_args(),
            [
                "nodetach",
                "notty",
                "noauth",
                "10.0.0.1:10.0.0.2",
                "debug",
                "lcp-echo-interval",
                "10"
            ]
        );
    }

    #[test]
    fn ip_pair_validation() {
        assert!(validate_ip_pair("10.0.0.1:").is_ok());
        assert!(validate_ip_pair(":10.0.0.2").is_ok());
        assert!(validate_ip_pair(":").is_err());
        assert!(validate_ip_pair("10.0.0.1").is_err());
        assert!(validate_ip_pair("10.0.0.300:10.0.0.2").is_err());
        let err = PppdConfig::from_conf(&conf(&["pppd.ip=bogus"])).expect_err("非法地址对");
        assert!(matches!(CoreError::from(err), CoreError::Init { .. }));
    }

    #[test]
    fn zero_mtu_is_rejected() {
        let err = PppdConfig::from_conf(&conf(&["pppd.mtu=0"])).expect_err("0 不是合法的读取上限");
        assert!(matches!(err, PppdError::InvalidValue { key: MTU_KEY, .. }));
    }

    #[tokio::test]
    async fn missing_binary_fails_start() {
        let config =
            PppdConfig::from_conf(&conf(&["pppd.path=/nonexistent/pppd"])).expect("合法配置");
        let mut interface = PppdInterface::new(config);
        let err = interface.start().await.expect_err("不存在的程序必须启动失败");
        assert!(matches!(err, CoreError::Start { .. }), "{err}");
        assert!(interface.pid().is_none());
    }
}
