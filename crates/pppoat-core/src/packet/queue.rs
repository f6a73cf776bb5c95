use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Packet;
use crate::error::{Error, Result};

/// 默认队列深度。
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// 非阻塞入队失败时归还报文。
#[derive(Debug)]
pub enum TryPushError {
    /// 队列已满，调用方可稍后重试或丢弃。
    Full(Packet),
    /// 队列已关闭。
    Closed(Packet),
}

impl TryPushError {
    pub fn into_packet(self) -> Packet {
        match self {
            TryPushError::Full(packet) | TryPushError::Closed(packet) => packet,
        }
    }
}

/// 单生产者、单消费者的有界报文队列。
///
/// # 契约说明（What）
/// - 严格 FIFO：关闭前不重排、不复制、不丢失；
/// - [`push`](Self::push) 在队满时等待空位，关闭后返回 [`Error::Closed`]；
/// - [`pop`](Self::pop) 在队空时等待，关闭后先取完剩余报文，再返回 [`Error::Closed`]；
/// - [`close`](Self::close) 幂等，并唤醒所有等待者。
///
/// # 实现策略（How）
/// - 状态由一把互斥锁保护，`readable`/`writable` 两个 [`Notify`] 充当条件变量；
/// - 等待方先登记 `Notified` 再检查状态，关闭方在锁内置位后 `notify_waiters`，因而唤醒不会丢失；
/// - 出入队本身在锁内同步完成，等待中的 future 被丢弃时不会吞掉报文。
#[derive(Debug)]
pub struct PacketQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Packet>,
    closed: bool,
    pushed: u64,
    popped: u64,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl PacketQueue {
    /// 创建深度为 `capacity` 的队列；`capacity` 为 0 时按 1 处理。
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                ..QueueState::default()
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 累计成功入队数。
    pub fn pushed(&self) -> u64 {
        self.state.lock().pushed
    }

    /// 累计成功出队数。
    pub fn popped(&self) -> u64 {
        self.state.lock().popped
    }

    /// 非阻塞入队。
    pub fn try_push(&self, packet: Packet) -> Result<(), TryPushError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TryPushError::Closed(packet));
            }
            if state.items.len() >= self.capacity {
                return Err(TryPushError::Full(packet));
            }
            state.items.push_back(packet);
            state.pushed += 1;
        }
        self.readable.notify_one();
        Ok(())
    }

    /// 入队；队满时等待空位或关闭。关闭时报文被释放。
    pub async fn push(&self, packet: Packet) -> Result<()> {
        let mut packet = packet;
        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();
            match self.try_push(packet) {
                Ok(()) => return Ok(()),
                Err(TryPushError::Closed(_)) => return Err(Error::Closed),
                Err(TryPushError::Full(back)) => packet = back,
            }
            writable.await;
        }
    }

    /// 非阻塞出队：有报文返回 `Some`，空队返回 `None`，关闭且取尽返回 [`Error::Closed`]。
    pub fn try_pop(&self) -> Result<Option<Packet>> {
        let popped = {
            let mut state = self.state.lock();
            match state.items.pop_front() {
                Some(packet) => {
                    state.popped += 1;
                    packet
                }
                None if state.closed => return Err(Error::Closed),
                None => return Ok(None),
            }
        };
        self.writable.notify_one();
        Ok(Some(popped))
    }

    /// 出队；队空时等待新报文或关闭。
    pub async fn pop(&self) -> Result<Packet> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();
            if let Some(packet) = self.try_pop()? {
                return Ok(packet);
            }
            readable.await;
        }
    }

    /// 关闭队列：此后入队均失败，已入队的报文仍可被取出。
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::packet::ModuleId;

    fn packet(tag: u8) -> Packet {
        Packet::from_slice(ModuleId(1), &[tag])
    }

    #[test]
    fn try_push_reports_full_and_returns_packet() {
        let queue = PacketQueue::new(1);
        queue.try_push(packet(1)).expect("首个报文应入队");
        match queue.try_push(packet(2)) {
            Err(TryPushError::Full(back)) => assert_eq!(back.as_slice(), [2]),
            other => panic!("期望 Full，实际 {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let queue = PacketQueue::new(4);
        queue.try_push(packet(1)).expect("入队");
        queue.try_push(packet(2)).expect("入队");
        queue.close();
        queue.close();
        assert!(matches!(queue.try_push(packet(3)), Err(TryPushError::Closed(_))));
        assert_eq!(queue.try_pop().expect("剩余报文").map(|p| p.as_slice()[0]), Some(1));
        assert_eq!(queue.try_pop().expect("剩余报文").map(|p| p.as_slice()[0]), Some(2));
        assert!(matches!(queue.try_pop(), Err(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_pop_wakes_on_close() {
        let queue = Arc::new(PacketQueue::new(2));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let outcome = waiter.await.expect("等待任务不应 panic");
        assert!(matches!(outcome, Err(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_push_resumes_after_pop() {
        let queue = Arc::new(PacketQueue::new(1));
        queue.push(packet(1)).await.expect("首个报文应入队");
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(packet(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "队满时 push 必须等待");
        assert_eq!(queue.pop().await.expect("出队").as_slice(), [1]);
        producer
            .await
            .expect("生产任务不应 panic")
            .expect("腾出空位后应入队成功");
        assert_eq!(queue.pop().await.expect("出队").as_slice(), [2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fifo_order_under_backpressure() {
        const COUNT: u32 = 2_000;
        let queue = Arc::new(PacketQueue::new(8));
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..COUNT {
                    let bytes = i.to_be_bytes();
                    queue
                        .push(Packet::from_slice(ModuleId(1), &bytes))
                        .await
                        .expect("持续入队");
                }
                queue.close();
            })
        };
        let mut expected = 0u32;
        while let Ok(packet) = queue.pop().await {
            let value = u32::from_be_bytes(packet.as_slice().try_into().expect("4 字节负载"));
            assert_eq!(value, expected, "报文顺序被打乱");
            expected += 1;
        }
        producer.await.expect("生产任务不应 panic");
        assert_eq!(expected, COUNT);
        assert_eq!(queue.pushed(), u64::from(COUNT));
        assert_eq!(queue.popped(), u64::from(COUNT));
    }

    #[tokio::test]
    async fn cancelled_pop_keeps_later_items() {
        let queue = PacketQueue::new(2);
        let timed_out = tokio::time::timeout(Duration::from_millis(5), queue.pop()).await;
        assert!(timed_out.is_err());
        queue.try_push(packet(9)).expect("入队");
        assert_eq!(queue.pop().await.expect("出队").as_slice(), [9]);
    }
}
