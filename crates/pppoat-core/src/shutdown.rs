//! 停机协调：把异步到达的终止信号与进程内的致命故障汇聚为一次确定的唤醒。

use core::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicUsize, Ordering},
};

use futures_util::FutureExt;
use tokio::sync::Notify;

#[cfg(unix)]
use crate::error::{Error, Result};

/// 停机原因，仅记录第一次请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShutdownCause {
    /// SIGINT。
    Interrupt = 1,
    /// SIGTERM。
    Terminate = 2,
    /// 模块工作任务在稳态运行中失败。
    ModuleFailure = 3,
    /// 进程内主动请求。
    Requested = 4,
}

impl ShutdownCause {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ShutdownCause::Interrupt),
            2 => Some(ShutdownCause::Terminate),
            3 => Some(ShutdownCause::ModuleFailure),
            4 => Some(ShutdownCause::Requested),
            _ => None,
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownCause::Interrupt => "SIGINT",
            ShutdownCause::Terminate => "SIGTERM",
            ShutdownCause::ModuleFailure => "module failure",
            ShutdownCause::Requested => "requested",
        })
    }
}

struct ShutdownInner {
    cause: AtomicU8,
    posts: AtomicUsize,
    wake: Notify,
}

/// 停机协调器。
///
/// # 契约说明（What）
/// - 任意多个 [`ShutdownTrigger`] 可并发投递请求，唯一的等待方通过 [`wait`](Self::wait) 被唤醒；
/// - 投递多次最多只保存**一次**唤醒，等待方在两次 [`reset`](Self::reset) 之间只会醒来一次；
/// - 唤醒后可读取第一次请求记录的 [`ShutdownCause`]。
///
/// # 实现策略（How）
/// - `Notify::notify_one` 在无等待者时保存单个许可，天然满足“一次唤醒”语义；
/// - 信号处理由 tokio 的信号驱动完成，本模块只在普通任务上下文中投递请求。
pub struct ShutdownCoordinator {
    inner: Arc<ShutdownInner>,
}

/// 停机请求的投递端，可自由克隆。
#[derive(Clone)]
pub struct ShutdownTrigger {
    inner: Arc<ShutdownInner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                cause: AtomicU8::new(0),
                posts: AtomicUsize::new(0),
                wake: Notify::new(),
            }),
        }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            inner: Arc::clone(&self.inner),
        }
    }

    /// 等待停机请求，返回第一次请求的原因。
    pub async fn wait(&self) -> ShutdownCause {
        self.inner.wake.notified().await;
        let cause = self.cause().unwrap_or(ShutdownCause::Requested);
        tracing::info!(%cause, posts = self.posts(), "shutdown requested");
        cause
    }

    /// 非阻塞地消费已保存的唤醒。
    pub fn try_wait(&self) -> Option<ShutdownCause> {
        self.inner
            .wake
            .notified()
            .now_or_never()
            .map(|()| self.cause().unwrap_or(ShutdownCause::Requested))
    }

    /// 丢弃尚未消费的唤醒并清除原因。
    pub fn reset(&self) {
        let _ = self.inner.wake.notified().now_or_never();
        self.inner.cause.store(0, Ordering::Release);
        self.inner.posts.store(0, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.cause().is_some()
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        ShutdownCause::from_raw(self.inner.cause.load(Ordering::Acquire))
    }

    /// 自创建或上次 `reset` 以来的投递次数。
    pub fn posts(&self) -> usize {
        self.inner.posts.load(Ordering::Acquire)
    }

    /// 把 SIGINT 与 SIGTERM 桥接为停机请求，须在 tokio 运行时内调用。
    #[cfg(unix)]
    pub fn install_signal_bridge(&self) -> Result<SignalBridge> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let trigger = self.trigger();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = interrupt.recv() => trigger.request(ShutdownCause::Interrupt),
                    Some(()) = terminate.recv() => trigger.request(ShutdownCause::Terminate),
                    else => break,
                }
            }
        });
        tracing::debug!("signal bridge installed");
        Ok(SignalBridge { task })
    }
}

impl ShutdownTrigger {
    /// 投递停机请求。可在任意任务中重复调用。
    pub fn request(&self, cause: ShutdownCause) {
        self.inner.posts.fetch_add(1, Ordering::AcqRel);
        let _ = self.inner.cause.compare_exchange(
            0,
            cause as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::debug!(%cause, "shutdown posted");
        self.inner.wake.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.cause.load(Ordering::Acquire) != 0
    }
}

/// 已安装的信号桥接任务。
#[cfg(unix)]
pub struct SignalBridge {
    task: tokio::task::JoinHandle<()>,
}

#[cfg(unix)]
impl SignalBridge {
    /// 撤销桥接并把 SIGINT/SIGTERM 恢复为系统默认处置，停机期间再次收到信号将直接终止进程。
    pub fn restore_defaults(self) -> Result<()> {
        use nix::sys::signal::{SigHandler, Signal};

        self.task.abort();
        set_disposition(Signal::SIGINT, SigHandler::SigDfl)?;
        set_disposition(Signal::SIGTERM, SigHandler::SigDfl)?;
        tracing::debug!("default signal disposition restored");
        Ok(())
    }
}

/// 进程生命周期内忽略 SIGPIPE，写入已关闭的管道或套接字改为返回 `EPIPE`。
#[cfg(unix)]
pub fn ignore_broken_pipe() -> Result<()> {
    use nix::sys::signal::{SigHandler, Signal};

    set_disposition(Signal::SIGPIPE, SigHandler::SigIgn)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn set_disposition(
    signal: nix::sys::signal::Signal,
    handler: nix::sys::signal::SigHandler,
) -> Result<()> {
    // SAFETY: 仅安装 SIG_DFL/SIG_IGN，不注册任何用户处理函数。
    unsafe { nix::sys::signal::signal(signal, handler) }
        .map(|_| ())
        .map_err(|errno| Error::Io(errno.into()))
}
