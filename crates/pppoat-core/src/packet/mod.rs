//! 报文：在模块间流转的单个链路层帧。
//!
//! 报文在任意时刻只有一个持有者（生产模块、某个队列或消费模块），所有权随
//! `push`/`pop` 整体转移，不存在共享读写。来自 [`PacketPool`] 的报文在 `Drop`
//! 时自动把缓冲归还池中。

mod pool;
mod queue;

use core::fmt;

use bytes::BytesMut;

pub use pool::{DEFAULT_POOL_LIMIT, PacketPool, PoolStats};
pub use queue::{DEFAULT_QUEUE_DEPTH, PacketQueue, TryPushError};

use pool::Recycler;

/// 模块标识，同一 [`Context`](crate::Context) 内唯一，用作报文的来源标签。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub(crate) u32);

impl ModuleId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 单个帧及其来源标签。
pub struct Packet {
    payload: BytesMut,
    origin: ModuleId,
    recycler: Option<Recycler>,
}

impl Packet {
    /// 以现成缓冲构造不归属任何池的报文。
    pub fn new(origin: ModuleId, payload: BytesMut) -> Self {
        Self {
            payload,
            origin,
            recycler: None,
        }
    }

    /// 复制切片内容构造报文。
    pub fn from_slice(origin: ModuleId, data: &[u8]) -> Self {
        Self::new(origin, BytesMut::from(data))
    }

    pub(crate) fn pooled(origin: ModuleId, payload: BytesMut, recycler: Recycler) -> Self {
        Self {
            payload,
            origin,
            recycler: Some(recycler),
        }
    }

    /// 产生该报文的模块。
    pub fn origin(&self) -> ModuleId {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.payload
    }

    /// 可写负载，驱动读入资源数据时直接在其上 `resize`/`truncate`。
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// 是否来自报文池。
    pub fn is_pooled(&self) -> bool {
        self.recycler.is_some()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            recycler.reclaim(core::mem::take(&mut self.payload));
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("origin", &self.origin)
            .field("len", &self.payload.len())
            .field("pooled", &self.recycler.is_some())
            .finish()
    }
}
