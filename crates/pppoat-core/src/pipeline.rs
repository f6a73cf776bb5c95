//! 流水线：模块的有序集合、就绪闸门与相邻模块间的链路表。
//!
//! # 契约说明（What）
//! - 模块只能在闸门**从未打开**前通过 [`Pipeline::add_module`] 加入；
//! - [`Pipeline::set_ready`]`(true)` 要求所有已注册模块处于 RUNNING，
//!   首次打开时为每对相邻模块 `(i, i+1)` 建立下行队列 `i → i+1` 与上行队列 `i+1 → i`；
//! - 闸门关闭先于任何模块停止；关闭后工作任务在开始新一次传输前都会重新检查闸门，
//!   每个模块至多还有一个已在途的报文完成投递；
//! - [`Pipeline::remove_module`] 注销模块并关闭其关联的全部队列。
//!
//! # 实现策略（How）
//! - 模块列表与就绪标志由同一把 `parking_lot::Mutex` 保护；
//! - 就绪状态经 `tokio::sync::watch` 发布给各工作任务；
//! - 链路表一经建立即不再变化，存放在 `OnceLock` 中供工作任务无锁读取。

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    error::{Error, Result},
    module::{Module, ModuleState, StateCell, StopToken},
    packet::{DEFAULT_QUEUE_DEPTH, ModuleId, Packet, PacketPool, PacketQueue, TryPushError},
};

/// 报文相对当前模块的流向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// 朝向列表前端（接口侧）。
    Upstream,
    /// 朝向列表末端（传输侧）。
    Downstream,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Upstream => Side::Downstream,
            Side::Downstream => Side::Upstream,
        }
    }
}

/// 流水线。
pub struct Pipeline {
    state: Mutex<PipelineState>,
    gate: watch::Sender<bool>,
    links: OnceLock<LinkTable>,
    queue_depth: usize,
}

#[derive(Default)]
struct PipelineState {
    entries: Vec<Entry>,
    ready: bool,
    ever_ready: bool,
}

struct Entry {
    id: ModuleId,
    name: String,
    state: Arc<StateCell>,
}

#[derive(Default)]
struct LinkTable {
    ports: HashMap<ModuleId, Ports>,
    queues: Vec<Arc<PacketQueue>>,
}

/// 单个模块与相邻模块之间的收发端口。
#[derive(Clone, Default)]
struct Ports {
    upstream: Option<Link>,
    downstream: Option<Link>,
}

#[derive(Clone)]
struct Link {
    tx: Arc<PacketQueue>,
    rx: Arc<PacketQueue>,
}

impl Link {
    fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

impl Ports {
    fn link(&self, side: Side) -> Option<&Link> {
        match side {
            Side::Upstream => self.upstream.as_ref(),
            Side::Downstream => self.downstream.as_ref(),
        }
    }

    async fn pop_any(&self) -> Result<(Side, Packet)> {
        match (&self.upstream, &self.downstream) {
            (Some(up), Some(down)) => tokio::select! {
                packet = up.rx.pop() => packet.map(|p| (Side::Upstream, p)),
                packet = down.rx.pop() => packet.map(|p| (Side::Downstream, p)),
            },
            (Some(up), None) => up.rx.pop().await.map(|p| (Side::Upstream, p)),
            (None, Some(down)) => down.rx.pop().await.map(|p| (Side::Downstream, p)),
            (None, None) => core::future::pending().await,
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl Pipeline {
    /// 创建空流水线，链路队列深度为 `queue_depth`。
    pub fn new(queue_depth: usize) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            state: Mutex::new(PipelineState::default()),
            gate,
            links: OnceLock::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// 追加模块。
    ///
    /// # Panics
    /// 闸门曾经打开过，或该模块已注册。
    pub fn add_module(&self, module: &Module) {
        let mut state = self.state.lock();
        assert!(
            !state.ever_ready,
            "流水线已打开过，不能再加入模块 {}",
            module.name()
        );
        assert!(
            state.entries.iter().all(|entry| entry.id != module.id()),
            "模块 {} 重复注册",
            module.name()
        );
        state.entries.push(Entry {
            id: module.id(),
            name: module.name().to_owned(),
            state: module.state_cell(),
        });
        tracing::debug!(module = module.name(), position = state.entries.len() - 1, "module added");
    }

    /// 注销模块并关闭它关联的全部队列，返回模块是否曾注册。
    pub fn remove_module(&self, id: ModuleId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let position = state.entries.iter().position(|entry| entry.id == id);
            position.map(|index| state.entries.remove(index))
        };
        let Some(entry) = removed else {
            return false;
        };
        if let Some(ports) = self.links.get().and_then(|table| table.ports.get(&id)) {
            for link in [&ports.upstream, &ports.downstream].into_iter().flatten() {
                link.close();
            }
        }
        tracing::debug!(module = %entry.name, "module removed");
        true
    }

    /// 打开或关闭就绪闸门。
    ///
    /// # Panics
    /// 打开时存在未处于 RUNNING 的已注册模块。
    pub fn set_ready(&self, ready: bool) {
        let mut state = self.state.lock();
        if ready {
            if let Some(entry) = state
                .entries
                .iter()
                .find(|entry| entry.state.get() != ModuleState::Running)
            {
                panic!(
                    "模块 {} 处于 {}，流水线不能就绪",
                    entry.name,
                    entry.state.get()
                );
            }
            if !state.ever_ready {
                let _ = self.links.set(self.build_links(&state.entries));
            }
            state.ever_ready = true;
        }
        if state.ready == ready {
            return;
        }
        state.ready = ready;
        self.gate.send_replace(ready);
        tracing::info!(ready, modules = state.entries.len(), "pipeline readiness changed");
    }

    fn build_links(&self, entries: &[Entry]) -> LinkTable {
        let mut table = LinkTable::default();
        for entry in entries {
            table.ports.insert(entry.id, Ports::default());
        }
        for pair in entries.windows(2) {
            let (left, right) = (pair[0].id, pair[1].id);
            let down = Arc::new(PacketQueue::new(self.queue_depth));
            let up = Arc::new(PacketQueue::new(self.queue_depth));
            if let Some(ports) = table.ports.get_mut(&left) {
                ports.downstream = Some(Link {
                    tx: Arc::clone(&down),
                    rx: Arc::clone(&up),
                });
            }
            if let Some(ports) = table.ports.get_mut(&right) {
                ports.upstream = Some(Link {
                    tx: Arc::clone(&up),
                    rx: Arc::clone(&down),
                });
            }
            table.queues.push(down);
            table.queues.push(up);
        }
        table
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn module_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.state.lock().entries.iter().any(|entry| entry.id == id)
    }

    /// 按注册顺序返回模块名。
    pub fn module_names(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// 链路表中的全部队列（下行、上行交替排列）；闸门从未打开时为空。
    pub fn queues(&self) -> Vec<Arc<PacketQueue>> {
        self.links
            .get()
            .map(|table| table.queues.clone())
            .unwrap_or_default()
    }

    fn ports(&self, id: ModuleId) -> Option<Ports> {
        self.links.get()?.ports.get(&id).cloned()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }
}

/// 工作任务访问流水线的句柄。
///
/// 所有收发操作都会先等待闸门打开，并与模块的 [`StopToken`] 竞争；
/// 模块被停止时返回 [`Error::Closed`]。
pub struct ModuleIo {
    id: ModuleId,
    pipeline: Arc<Pipeline>,
    packets: PacketPool,
    stop: StopToken,
    gate: watch::Receiver<bool>,
    ports: OnceLock<Ports>,
}

impl ModuleIo {
    pub fn new(id: ModuleId, pipeline: Arc<Pipeline>, packets: PacketPool, stop: StopToken) -> Self {
        let gate = pipeline.subscribe();
        Self {
            id,
            pipeline,
            packets,
            stop,
            gate,
            ports: OnceLock::new(),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// 模块是否已被要求停止。
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 等待模块被要求停止，供驱动在自有 IO 上竞争使用。
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// 从报文池为本模块租借一个空报文。
    pub fn alloc(&self, capacity: usize) -> Result<Packet> {
        self.packets.alloc(self.id, capacity)
    }

    /// 租借报文并写入 `data`。
    pub fn alloc_from(&self, data: &[u8]) -> Result<Packet> {
        self.packets.alloc_from(self.id, data)
    }

    /// 等待闸门打开。
    pub async fn ready(&self) -> Result<()> {
        let mut gate = self.gate.clone();
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(Error::Closed),
            opened = gate.wait_for(|open| *open) => opened.map(|_| ()).map_err(|_| Error::Closed),
        }
    }

    fn ports(&self) -> Result<&Ports> {
        if let Some(ports) = self.ports.get() {
            return Ok(ports);
        }
        let ports = self.pipeline.ports(self.id).ok_or(Error::Closed)?;
        Ok(self.ports.get_or_init(|| ports))
    }

    /// 接收任一相邻模块发来的报文，返回其来向。
    pub async fn recv_from(&self) -> Result<(Side, Packet)> {
        loop {
            self.ready().await?;
            let ports = self.ports()?;
            let mut gate = self.gate.clone();
            let received = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(Error::Closed),
                _ = gate.wait_for(|open| !*open) => None,
                received = ports.pop_any() => Some(received?),
            };
            if let Some(received) = received {
                return Ok(received);
            }
        }
    }

    /// 接收报文，忽略来向。
    pub async fn recv(&self) -> Result<Packet> {
        self.recv_from().await.map(|(_, packet)| packet)
    }

    /// 向 `side` 方向的相邻模块发送报文；该方向没有相邻模块时报文被丢弃。
    pub async fn send(&self, side: Side, packet: Packet) -> Result<()> {
        self.ready().await?;
        let Some(link) = self.ports()?.link(side) else {
            tracing::trace!(module = %self.id, ?side, len = packet.len(), "no neighbour, frame dropped");
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(Error::Closed),
            pushed = link.tx.push(packet) => pushed,
        }
    }

    /// 非阻塞地向 `side` 方向发送：队满时原样归还报文，由调用方决定丢弃或重试。
    ///
    /// 仍会等待闸门打开，但不会因对端消费缓慢而挂起，适合在同时服务入站方向的工作循环中使用。
    pub async fn try_send(&self, side: Side, packet: Packet) -> Result<Option<Packet>> {
        self.ready().await?;
        let Some(link) = self.ports()?.link(side) else {
            tracing::trace!(module = %self.id, ?side, len = packet.len(), "no neighbour, frame dropped");
            return Ok(None);
        };
        match link.tx.try_push(packet) {
            Ok(()) => Ok(None),
            Err(TryPushError::Full(packet)) => Ok(Some(packet)),
            Err(TryPushError::Closed(_)) => Err(Error::Closed),
        }
    }

    /// 有下行邻居时为下行，否则为上行。
    fn emit_side(&self) -> Result<Side> {
        Ok(if self.ports()?.downstream.is_some() {
            Side::Downstream
        } else {
            Side::Upstream
        })
    }

    /// 把本模块产生的报文送往流水线的另一端：有下行邻居时发往下行，否则发往上行。
    pub async fn emit(&self, packet: Packet) -> Result<()> {
        self.ready().await?;
        let side = self.emit_side()?;
        self.send(side, packet).await
    }

    /// [`emit`](Self::emit) 的非阻塞版本，队满时归还报文。
    pub async fn try_emit(&self, packet: Packet) -> Result<Option<Packet>> {
        self.ready().await?;
        let side = self.emit_side()?;
        self.try_send(side, packet).await
    }

    /// 把从 `from` 方向收到的报文原样转发到对侧。
    pub async fn forward(&self, from: Side, packet: Packet) -> Result<()> {
        self.send(from.opposite(), packet).await
    }
}
