//! 进程级根对象。

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use crate::{
    conf::Conf,
    error::Result,
    packet::{DEFAULT_POOL_LIMIT, DEFAULT_QUEUE_DEPTH, ModuleId, PacketPool},
    pipeline::Pipeline,
    shutdown::ShutdownTrigger,
};

/// 配置键：链路队列深度。
pub const QUEUE_DEPTH_KEY: &str = "pipeline.queue_depth";
/// 配置键：报文池在途上限。
pub const PACKET_LIMIT_KEY: &str = "packets.limit";

/// `Context` 持有配置、报文池与流水线，在进程内只构造一次。
///
/// 模块对其仅持有 `Weak` 引用；最后一个 `Arc` 释放即完成上下文拆除。
pub struct Context {
    conf: Conf,
    packets: PacketPool,
    pipeline: Arc<Pipeline>,
    shutdown: ShutdownTrigger,
    next_id: AtomicU32,
}

impl Context {
    /// 以已读入的配置构造上下文。
    ///
    /// `pipeline.queue_depth` 或 `packets.limit` 取值非法时返回 [`crate::Error::Conf`]。
    pub fn new(conf: Conf, shutdown: ShutdownTrigger) -> Result<Arc<Self>> {
        let queue_depth = conf
            .find_parsed::<usize>(QUEUE_DEPTH_KEY)?
            .unwrap_or(DEFAULT_QUEUE_DEPTH);
        let packet_limit = conf
            .find_parsed::<usize>(PACKET_LIMIT_KEY)?
            .unwrap_or(DEFAULT_POOL_LIMIT);
        tracing::debug!(queue_depth, packet_limit, "context created");
        Ok(Arc::new(Self {
            conf,
            packets: PacketPool::new(packet_limit),
            pipeline: Arc::new(Pipeline::new(queue_depth)),
            shutdown,
            next_id: AtomicU32::new(1),
        }))
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    pub fn packets(&self) -> &PacketPool {
        &self.packets
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn shutdown(&self) -> &ShutdownTrigger {
        &self.shutdown
    }

    pub(crate) fn next_module_id(&self) -> ModuleId {
        ModuleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let released = self.packets.shrink_to_fit();
        tracing::debug!(released, "context torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, shutdown::ShutdownCoordinator};

    #[test]
    fn reads_sizing_from_conf() {
        let conf = Conf::new();
        conf.store(QUEUE_DEPTH_KEY, "4");
        conf.store(PACKET_LIMIT_KEY, "16");
        let ctx = Context::new(conf, ShutdownCoordinator::new().trigger()).expect("合法配置");
        assert_eq!(ctx.pipeline().queue_depth(), 4);
        assert_eq!(ctx.packets().limit(), 16);
        assert_ne!(ctx.next_module_id(), ctx.next_module_id());
    }

    #[test]
    fn rejects_bad_sizing() {
        let conf = Conf::new();
        conf.store(QUEUE_DEPTH_KEY, "-1");
        let err = Context::new(conf, ShutdownCoordinator::new().trigger())
            .err()
            .expect("负数深度必须拒绝");
        assert!(matches!(err, Error::Conf(_)));
    }
}
