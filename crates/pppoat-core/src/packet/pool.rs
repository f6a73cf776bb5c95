use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use parking_lot::Mutex;

use super::{ModuleId, Packet};
use crate::error::{Error, Result};

/// 默认的在途报文上限。
pub const DEFAULT_POOL_LIMIT: usize = 256;

/// `PacketPool` 基于自由链表复用报文缓冲，并对在途报文数量设上限。
///
/// # 核心机制（How）
/// - 内部维护 `Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先复用容量足够的块；
/// - 在途租约数达到 `limit` 时 [`PacketPool::alloc`] 返回 [`Error::Alloc`]，由调用方决定丢弃或退出；
/// - [`Packet`] 在 `Drop` 时经 `Recycler` 把缓冲清空后放回链表，链表长度同样不超过 `limit`。
///
/// # 契约说明（What）
/// - 克隆得到的句柄共享同一个池；
/// - 返回的报文 `len() == 0`，`payload_mut().capacity() >= capacity`。
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

/// 报文池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 当前在途（未归还）的报文数。
    pub active: usize,
    /// 自由链表中缓存的缓冲数。
    pub free: usize,
    /// 累计新建缓冲次数。
    pub allocated: u64,
    /// 累计复用缓冲次数。
    pub reused: u64,
    /// 因达到上限而失败的租借次数。
    pub failed: u64,
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_LIMIT)
    }
}

impl PacketPool {
    /// 创建上限为 `limit` 的报文池；`limit` 为 0 时按 1 处理。
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free_list: Mutex::new(Vec::new()),
                limit: limit.max(1),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// 为 `origin` 租借一个容量至少为 `capacity` 的空报文。
    pub fn alloc(&self, origin: ModuleId, capacity: usize) -> Result<Packet> {
        if !self.inner.metrics.try_lease(self.inner.limit) {
            self.inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Alloc("报文池在途租约已达上限"));
        }
        let payload = self.inner.acquire_buffer(capacity);
        Ok(Packet::pooled(
            origin,
            payload,
            Recycler(Arc::clone(&self.inner)),
        ))
    }

    /// 租借报文并写入 `data`。
    pub fn alloc_from(&self, origin: ModuleId, data: &[u8]) -> Result<Packet> {
        let mut packet = self.alloc(origin, data.len())?;
        packet.payload_mut().extend_from_slice(data);
        Ok(packet)
    }

    /// 清空自由链表，返回释放的缓冲个数。
    pub fn shrink_to_fit(&self) -> usize {
        let mut list = self.inner.free_list.lock();
        let released = list.len();
        list.clear();
        released
    }

    pub fn stats(&self) -> PoolStats {
        let metrics = &self.inner.metrics;
        PoolStats {
            active: metrics.active.load(Ordering::Acquire),
            free: self.inner.free_list.lock().len(),
            allocated: metrics.allocated.load(Ordering::Relaxed),
            reused: metrics.reused.load(Ordering::Relaxed),
            failed: metrics.failed.load(Ordering::Relaxed),
        }
    }
}

struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    limit: usize,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn acquire_buffer(&self, capacity: usize) -> BytesMut {
        let reused = {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|buf| buf.capacity() >= capacity)
                .map(|index| list.swap_remove(index))
        };
        match reused {
            Some(mut buf) => {
                self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            None => {
                self.metrics.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(capacity)
            }
        }
    }
}

/// 报文归还池的钩子，由 [`Packet`] 在 `Drop` 时调用。
pub(crate) struct Recycler(Arc<PoolInner>);

impl Recycler {
    pub(crate) fn reclaim(self, mut buf: BytesMut) {
        let inner = self.0;
        inner.metrics.release_lease();
        buf.clear();
        let mut list = inner.free_list.lock();
        if list.len() < inner.limit && buf.capacity() > 0 {
            list.push(buf);
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    active: AtomicUsize,
    allocated: AtomicU64,
    reused: AtomicU64,
    failed: AtomicU64,
}

impl PoolMetrics {
    fn try_lease(&self, limit: usize) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_ok()
    }

    fn release_lease(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(prev.saturating_sub(1))
            });
    }
}
