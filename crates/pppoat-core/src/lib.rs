#![deny(unsafe_code)]
#![doc = "pppoat-core: PPP over Any Transport 的运行时核心。"]
#![doc = ""]
#![doc = "把一个接口模块（产生/消费链路层帧）与一个传输模块（把帧送往对端）组合为双向转发流水线，"]
#![doc = "并提供统一的模块生命周期、有界报文队列、Base64 帧编解码与信号驱动的停机协调。"]

pub mod base64;
pub mod conf;
pub mod context;
pub mod error;
pub mod logging;
pub mod module;
pub mod packet;
pub mod pipeline;
pub mod shutdown;
pub mod tunnel;

pub use conf::{Conf, ConfError};
pub use context::Context;
pub use error::{Error, Result};
pub use module::{Driver, DriverFactory, Module, ModuleKind, ModuleState, StateProbe, StopToken};
pub use packet::{ModuleId, Packet, PacketPool, PacketQueue, TryPushError};
pub use pipeline::{ModuleIo, Pipeline, Side};
#[cfg(unix)]
pub use shutdown::SignalBridge;
pub use shutdown::{ShutdownCause, ShutdownCoordinator, ShutdownTrigger};
pub use tunnel::{TeardownReport, Tunnel};
