//! 核心错误类型。
//!
//! 错误分为三类处理路径：
//! - 启动期（`Alloc`/`Init`/`Start`/`Conf`）：中止整个流水线启动并回滚；
//! - 数据面（`InvalidChar`/`InvalidLength`）：拒绝输入，不产生任何部分结果；
//! - 终止信号（`Closed`）：队列或模块已关闭，调用方据此退出循环，不视为故障。

use std::io;

use crate::conf::ConfError;

/// `pppoat-core` 的统一结果别名。
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// 运行时核心的统一错误枚举。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 资源耗尽（报文池租约已满等），不会重试。
    #[error("资源耗尽: {0}")]
    Alloc(&'static str),
    /// 驱动拒绝其配置或所需资源不可用。
    #[error("模块 {module} 初始化失败: {reason}")]
    Init { module: String, reason: String },
    /// 驱动无法打开底层资源（设备忙、端口绑定失败等）。
    #[error("模块 {module} 启动失败: {source}")]
    Start {
        module: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// Base64 文本包含字母表之外的字符。
    #[error("Base64 输入第 {position} 个字符非法 (0x{byte:02x})")]
    InvalidChar { position: usize, byte: u8 },
    /// Base64 文本长度不是 4 的倍数。
    #[error("Base64 输入长度 {0} 不是 4 的倍数")]
    InvalidLength(usize),
    /// 队列或模块已关闭。
    #[error("通道已关闭")]
    Closed,
    /// 配置读取或解析失败。
    #[error(transparent)]
    Conf(#[from] ConfError),
    /// 底层 IO 失败。
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// 构造初始化错误。
    pub fn init(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Init {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// 以任意底层错误构造启动错误。
    pub fn start<E>(module: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Start {
            module: module.into(),
            source: Box::new(source),
        }
    }

    /// 以文字描述构造启动错误。
    pub fn start_msg(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Start {
            module: module.into(),
            source: message.into().into(),
        }
    }

    /// 是否为正常的关闭信号。
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_error_keeps_source_chain() {
        let err = Error::start("udp", io::Error::new(io::ErrorKind::AddrInUse, "busy"));
        let source = std::error::Error::source(&err).expect("应保留底层错误");
        assert_eq!(source.to_string(), "busy");
        assert!(err.to_string().contains("udp"));
    }

    #[test]
    fn closed_is_not_a_failure() {
        assert!(Error::Closed.is_closed());
        assert!(!Error::Alloc("packets").is_closed());
    }
}
