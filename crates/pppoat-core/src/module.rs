//! 模块：对一个可插拔驱动（接口驱动或传输驱动）的统一封装。
//!
//! # 生命周期
//!
//! ```text
//! CREATED ──run──▶ RUNNING ──stop──▶ STOPPED ──finalize──▶ FINALIZED
//!    │                                                      ▲
//!    └──────────────────────finalize────────────────────────┘
//! ```
//!
//! - 状态只能沿上图推进，非法迁移是编程错误，直接断言失败；
//! - 驱动 `start` 成功返回后才进入 RUNNING，启动失败的模块停留在 CREATED；
//! - `run` 成功后驱动的 [`Driver::serve`] 在独立的 tokio 任务中执行；
//! - `stop` 通过 [`StopToken`] 取消工作任务中所有等待点，等待任务退出后再交由驱动释放资源；
//! - 模块对 [`Context`] 仅持有 `Weak` 引用，只用于访问共享资源。

use core::fmt;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU8, Ordering},
};

use async_trait::async_trait;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::Instrument;

use crate::{
    conf::Conf,
    context::Context,
    error::{Error, Result},
    packet::ModuleId,
    pipeline::ModuleIo,
    shutdown::ShutdownCause,
};

/// 驱动在流水线中的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// 链路侧：产生/消费链路层帧（pppd 进程、虚拟网卡）。
    Interface,
    /// 网络侧：把帧送往对端。
    Transport,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleKind::Interface => "interface",
            ModuleKind::Transport => "transport",
        })
    }
}

/// 模块生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ModuleState {
    Created = 0,
    Running = 1,
    Stopped = 2,
    Finalized = 3,
}

impl ModuleState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ModuleState::Created,
            1 => ModuleState::Running,
            2 => ModuleState::Stopped,
            _ => ModuleState::Finalized,
        }
    }

    /// 是否允许从 `self` 迁移到 `next`。
    pub fn can_transition(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Created, Running) | (Running, Stopped)
                | (Stopped, Finalized)
                | (Created, Finalized)
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleState::Created => "CREATED",
            ModuleState::Running => "RUNNING",
            ModuleState::Stopped => "STOPPED",
            ModuleState::Finalized => "FINALIZED",
        })
    }
}

/// 模块状态单元，由模块与流水线共享。
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ModuleState::Created as u8))
    }

    pub(crate) fn get(&self) -> ModuleState {
        ModuleState::from_raw(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, name: &str, next: ModuleState) {
        let current = self.get();
        assert!(
            current.can_transition(next),
            "模块 {name} 非法状态迁移: {current} -> {next}"
        );
        self.0.store(next as u8, Ordering::Release);
    }
}

/// 模块状态的只读观察句柄，模块被 `finalize` 消费后仍可读取最终状态。
#[derive(Clone, Debug)]
pub struct StateProbe(Arc<StateCell>);

impl StateProbe {
    pub fn get(&self) -> ModuleState {
        self.0.get()
    }
}

/// 工作任务的取消令牌。
///
/// `cancel` 之后，所有正在或将要等待 [`StopToken::cancelled`] 的调用都会立即返回。
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// 等待取消。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 驱动契约。
///
/// 模块按固定顺序调用：`start` → `serve`（独立任务）→ `stop` → `finalize`。
/// 驱动只需保证 `serve` 内所有阻塞点都与 [`ModuleIo::stopped`] 竞争，
/// 或直接使用 [`ModuleIo`] 提供的收发接口（已内置取消）。
#[async_trait]
pub trait Driver: Send + 'static {
    /// 驱动名，用于日志与报告。
    fn name(&self) -> &str;

    fn kind(&self) -> ModuleKind;

    /// 打开底层资源（进程、设备、套接字）。失败时应返回 [`Error::Start`]。
    async fn start(&mut self) -> Result<()>;

    /// 工作循环：在底层资源与 [`ModuleIo`] 之间搬运帧。
    ///
    /// 返回 `Ok(())` 或 [`Error::Closed`] 视为正常退出；其他错误视为致命故障，
    /// 模块会请求整个进程停机。
    async fn serve(&mut self, io: &ModuleIo) -> Result<()>;

    /// 工作任务退出后释放底层资源；错误仅记录日志。
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// 释放剩余的全部状态。
    fn finalize(&mut self) {}
}

/// 驱动工厂：读取配置并构造驱动实例。
pub trait DriverFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ModuleKind;

    /// 校验配置并构造驱动；缺少必需键或取值非法时返回 [`Error::Init`]。
    fn init(&self, conf: &Conf) -> Result<Box<dyn Driver>>;
}

enum DriverSlot {
    Idle(Box<dyn Driver>),
    Running(JoinHandle<Box<dyn Driver>>),
    Released,
}

/// 单个驱动的生命周期封装。
pub struct Module {
    id: ModuleId,
    name: String,
    kind: ModuleKind,
    state: Arc<StateCell>,
    slot: DriverSlot,
    stop: StopToken,
    ctx: Weak<Context>,
}

impl Module {
    /// 以 `factory` 读取 `ctx` 中的配置并创建模块。
    ///
    /// 失败时不产生模块对象，也不保留任何资源。
    pub fn init(factory: &dyn DriverFactory, ctx: &Arc<Context>) -> Result<Self> {
        let driver = factory.init(ctx.conf()).inspect_err(|err| {
            tracing::error!(module = factory.name(), error = %err, "module init failed");
        })?;
        let module = Self {
            id: ctx.next_module_id(),
            name: driver.name().to_owned(),
            kind: driver.kind(),
            state: Arc::new(StateCell::new()),
            slot: DriverSlot::Idle(driver),
            stop: StopToken::new(),
            ctx: Arc::downgrade(ctx),
        };
        tracing::debug!(module = %module.name, id = %module.id, kind = %module.kind, "module created");
        Ok(module)
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn state(&self) -> ModuleState {
        self.state.get()
    }

    pub fn probe(&self) -> StateProbe {
        StateProbe(Arc::clone(&self.state))
    }

    pub(crate) fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    /// 打开底层资源并启动工作任务。
    ///
    /// - **前置条件**：状态为 CREATED 且已注册到流水线；重复调用直接断言失败；
    /// - **失败**：底层资源无法打开时返回 [`Error::Start`]，状态保持 CREATED，
    ///   调用方应视为“模块未启动”；
    /// - 状态在 `start` 成功返回后才变为 RUNNING，启动期间流水线不能为其打开闸门。
    pub async fn run(&mut self) -> Result<()> {
        assert_eq!(
            self.state.get(),
            ModuleState::Created,
            "模块 {} 只能启动一次",
            self.name
        );
        let ctx = self
            .ctx
            .upgrade()
            .ok_or_else(|| Error::start_msg(&self.name, "上下文已释放"))?;
        debug_assert!(
            ctx.pipeline().contains(self.id),
            "模块 {} 启动前必须先注册到流水线",
            self.name
        );

        let mut driver = match core::mem::replace(&mut self.slot, DriverSlot::Released) {
            DriverSlot::Idle(driver) => driver,
            other => {
                self.slot = other;
                return Err(Error::start_msg(&self.name, "驱动不在空闲状态"));
            }
        };

        if let Err(err) = driver.start().await {
            tracing::error!(module = %self.name, error = %err, "module start failed");
            self.slot = DriverSlot::Idle(driver);
            return Err(err);
        }
        self.state.transition(&self.name, ModuleState::Running);

        let io = ModuleIo::new(
            self.id,
            Arc::clone(ctx.pipeline()),
            ctx.packets().clone(),
            self.stop.clone(),
        );
        let trigger = ctx.shutdown().clone();
        let span = tracing::info_span!("module", module = %self.name);
        let worker = tokio::spawn(
            async move {
                match driver.serve(&io).await {
                    Ok(()) => tracing::debug!("worker finished"),
                    Err(err) if err.is_closed() || io.is_stopping() => {
                        tracing::debug!(reason = %err, "worker exited on shutdown")
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "worker failed, requesting shutdown");
                        trigger.request(ShutdownCause::ModuleFailure);
                    }
                }
                driver
            }
            .instrument(span),
        );
        self.slot = DriverSlot::Running(worker);
        tracing::info!(module = %self.name, "module running");
        Ok(())
    }

    /// 取消工作任务并等待其退出，随后由驱动释放资源。始终成功。
    pub async fn stop(&mut self) {
        assert_eq!(
            self.state.get(),
            ModuleState::Running,
            "模块 {} 未处于运行状态",
            self.name
        );
        self.stop.cancel();
        if let DriverSlot::Running(worker) = core::mem::replace(&mut self.slot, DriverSlot::Released)
        {
            match worker.await {
                Ok(mut driver) => {
                    if let Err(err) = driver.stop().await {
                        tracing::warn!(module = %self.name, error = %err, "driver stop reported error");
                    }
                    self.slot = DriverSlot::Idle(driver);
                }
                Err(err) => {
                    tracing::error!(module = %self.name, error = %err, "worker task aborted");
                }
            }
        }
        self.state.transition(&self.name, ModuleState::Stopped);
        tracing::info!(module = %self.name, "module stopped");
    }

    /// 释放全部资源并进入 FINALIZED，只允许在 STOPPED 或 CREATED 状态调用。
    pub fn finalize(mut self) {
        self.state.transition(&self.name, ModuleState::Finalized);
        if let DriverSlot::Idle(mut driver) =
            core::mem::replace(&mut self.slot, DriverSlot::Released)
        {
            driver.finalize();
        }
        tracing::debug!(module = %self.name, "module finalized");
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if self.state.get() == ModuleState::Running {
            self.stop.cancel();
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use ModuleState::*;
        assert!(Created.can_transition(Running));
        assert!(Running.can_transition(Stopped));
        assert!(Stopped.can_transition(Finalized));
        assert!(Created.can_transition(Finalized));
        assert!(!Running.can_transition(Created));
        assert!(!Running.can_transition(Finalized));
        assert!(!Stopped.can_transition(Running));
        assert!(!Finalized.can_transition(Created));
        assert!(!Created.can_transition(Stopped));
    }

    #[test]
    #[should_panic(expected = "非法状态迁移")]
    fn skipping_a_state_panics() {
        let cell = StateCell::new();
        cell.transition("probe", ModuleState::Stopped);
    }

    #[tokio::test]
    async fn stop_token_wakes_waiters() {
        let token = StopToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        waiter.await.expect("等待任务不应 panic");
        assert!(token.is_cancelled());
        token.cancelled().await;
    }
}
