//! 进程级日志安装。
//!
//! # 教案式说明
//! - **逻辑（How）**：组装 `registry + 可重载 EnvFilter + stderr fmt` 并设置为全局 Subscriber，
//!   重载句柄存放在 `OnceLock` 中，读入配置后经 [`reconfigure`] 调整级别；
//! - **契约（What）**：`install` 只能成功一次；设置了 `RUST_LOG` 时以环境变量为准，配置中的
//!   `log.level` 不再生效。

use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, reload};

use crate::conf::Conf;

/// 配置键：日志级别或完整的 EnvFilter 指令。
pub const LOG_LEVEL_KEY: &str = "log.level";

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// 日志安装与重配置错误。
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("日志系统已安装，禁止重复调用 install")]
    AlreadyInstalled,
    #[error("进程内已存在其他全局 Subscriber")]
    SubscriberAlreadySet,
    #[error("日志尚未安装")]
    NotInstalled,
    #[error("无法解析日志过滤指令 `{directive}`: {source}")]
    InvalidFilter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("日志过滤器重载失败: {0}")]
    Reload(#[source] reload::Error),
}

/// 安装全局日志，`default_level` 在未设置 `RUST_LOG` 时生效。
pub fn install(default_level: &str) -> Result<(), LoggingError> {
    if FILTER_HANDLE.get().is_some() {
        return Err(LoggingError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(LoggingError::SubscriberAlreadySet);
    }

    let filter = EnvFilter::try_from_default_env().or_else(|_| parse_filter(default_level))?;
    let (filter, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| LoggingError::SubscriberAlreadySet)?;

    FILTER_HANDLE
        .set(handle)
        .map_err(|_| LoggingError::AlreadyInstalled)
}

/// 以新的指令替换当前过滤器。
pub fn set_level(directive: &str) -> Result<(), LoggingError> {
    let handle = FILTER_HANDLE.get().ok_or(LoggingError::NotInstalled)?;
    let filter = parse_filter(directive)?;
    handle.reload(filter).map_err(LoggingError::Reload)?;
    tracing::debug!(directive, "log filter reloaded");
    Ok(())
}

/// 按配置中的 `log.level` 调整日志级别；未配置或设置了 `RUST_LOG` 时不做任何事。
pub fn reconfigure(conf: &Conf) -> Result<(), LoggingError> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(());
    }
    match conf.find_string(LOG_LEVEL_KEY) {
        Some(directive) => set_level(&directive),
        None => Ok(()),
    }
}

fn parse_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directive).map_err(|source| LoggingError::InvalidFilter {
        directive: directive.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_directive_is_reported() {
        let err = parse_filter("udp=loud").expect_err("非法指令必须拒绝");
        assert!(err.to_string().contains("udp=loud"));
    }

    #[test]
    fn set_level_requires_install() {
        if FILTER_HANDLE.get().is_none() {
            assert!(matches!(set_level("info"), Err(LoggingError::NotInstalled)));
        }
    }
}
