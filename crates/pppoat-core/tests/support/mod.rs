//! 集成测试共用的内存驱动。
//!
//! - `Feeder`：接口侧，向下游发出 `count` 个编号报文，同时记录收到的回送报文；
//! - `Echo`：传输侧，把上游来的报文原样送回；
//! - `Idle`：只等待停止，可配置为启动失败或在运行中报错。

#![allow(dead_code)]

use std::{
    io::{Error as IoError, ErrorKind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use pppoat_core::{Conf, Driver, DriverFactory, Error, ModuleIo, ModuleKind, Result, Side};

/// 驱动生命周期回调的观测点。
#[derive(Clone, Default)]
pub struct Trace {
    pub started: Arc<AtomicBool>,
    pub stopped: Arc<AtomicBool>,
    pub finalized: Arc<AtomicBool>,
}

impl Trace {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

pub struct FeederFactory {
    pub count: u32,
    pub seen: Arc<Mutex<Vec<u32>>>,
    pub trace: Trace,
}

struct Feeder {
    count: u32,
    seen: Arc<Mutex<Vec<u32>>>,
    trace: Trace,
}

impl DriverFactory for FeederFactory {
    fn name(&self) -> &'static str {
        "feeder"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Interface
    }

    fn init(&self, _conf: &Conf) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Feeder {
            count: self.count,
            seen: Arc::clone(&self.seen),
            trace: self.trace.clone(),
        }))
    }
}

#[async_trait]
impl Driver for Feeder {
    fn name(&self) -> &str {
        "feeder"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Interface
    }

    async fn start(&mut self) -> Result<()> {
        self.trace.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn serve(&mut self, io: &ModuleIo) -> Result<()> {
        let count = self.count;
        let seen = Arc::clone(&self.seen);
        let produce = async {
            for index in 0..count {
                io.emit(io.alloc_from(&index.to_be_bytes())?).await?;
            }
            Ok::<(), Error>(())
        };
        tokio::try_join!(produce, collect_echoes(io, &seen)).map(|_| ())
    }

    async fn stop(&mut self) -> Result<()> {
        self.trace.stopped.store(true, Ordering::Release);
        Ok(())
    }

    fn finalize(&mut self) {
        self.trace.finalized.store(true, Ordering::Release);
    }
}

async fn collect_echoes(io: &ModuleIo, seen: &Mutex<Vec<u32>>) -> Result<()> {
    loop {
        let packet = io.recv().await?;
        let bytes: [u8; 4] = packet
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidLength(packet.len()))?;
        seen.lock().push(u32::from_be_bytes(bytes));
    }
}

pub struct EchoFactory;

struct Echo;

impl DriverFactory for EchoFactory {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Transport
    }

    fn init(&self, _conf: &Conf) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Echo))
    }
}

#[async_trait]
impl Driver for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Transport
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn serve(&mut self, io: &ModuleIo) -> Result<()> {
        loop {
            let (side, packet) = io.recv_from().await?;
            assert_eq!(side, Side::Upstream, "传输模块只有上游邻居");
            io.send(side, packet).await?;
        }
    }
}

/// `Idle` 的行为开关。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleMode {
    Healthy,
    FailStart,
    FailServe,
    RejectInit,
}

pub struct IdleFactory {
    pub name: &'static str,
    pub kind: ModuleKind,
    pub mode: IdleMode,
    pub trace: Trace,
}

impl IdleFactory {
    pub fn new(name: &'static str, kind: ModuleKind, mode: IdleMode) -> Self {
        Self {
            name,
            kind,
            mode,
            trace: Trace::default(),
        }
    }
}

struct Idle {
    name: &'static str,
    kind: ModuleKind,
    mode: IdleMode,
    trace: Trace,
}

impl DriverFactory for IdleFactory {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn init(&self, _conf: &Conf) -> Result<Box<dyn Driver>> {
        if self.mode == IdleMode::RejectInit {
            return Err(Error::init(self.name, "缺少必需配置项"));
        }
        Ok(Box::new(Idle {
            name: self.name,
            kind: self.kind,
            mode: self.mode,
            trace: self.trace.clone(),
        }))
    }
}

#[async_trait]
impl Driver for Idle {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    async fn start(&mut self) -> Result<()> {
        if self.mode == IdleMode::FailStart {
            return Err(Error::start(
                self.name,
                IoError::new(ErrorKind::AddrInUse, "端口已被占用"),
            ));
        }
        self.trace.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn serve(&mut self, io: &ModuleIo) -> Result<()> {
        if self.mode == IdleMode::FailServe {
            io.ready().await?;
            return Err(Error::Io(IoError::new(
                ErrorKind::BrokenPipe,
                "对端进程已退出",
            )));
        }
        io.stopped().await;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.trace.stopped.store(true, Ordering::Release);
        Ok(())
    }

    fn finalize(&mut self) {
        self.trace.finalized.store(true, Ordering::Release);
    }
}

/// 轮询直到 `condition` 成立，超时则 panic。
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "等待超时: {what}");
}
