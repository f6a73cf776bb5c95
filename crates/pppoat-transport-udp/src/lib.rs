#![doc = r#"
# pppoat-transport-udp

## 模块使命（Why）
- 把流水线中的链路层帧逐个装入 UDP 数据报送往对端，并把对端发来的数据报还原为帧；
- 对只能承载可打印负载的链路，提供 Base64 文本帧模式。

## 核心契约（What）
- 配置键：`udp.host`（必需）、`udp.port`（默认 5000）、`udp.src_port`/`udp.dst_port`（分别覆盖本端/对端端口）、
  `udp.bind`（默认 `0.0.0.0`）、`udp.mtu`（默认 1500）、`udp.base64`（默认关闭）；
- 一个数据报恰好承载一个帧；来源不是对端地址、超过 `udp.mtu` 的数据报记录告警后丢弃；
- 入站帧以非阻塞方式交给邻居，邻居队列已满时丢弃并计入 `dropped`，工作循环不会因此停止收发；
- Base64 模式下收到的文本先经 `is_valid` 校验，非法帧记录告警后丢弃，不会中断隧道。

## 实现策略（How）
- 通过 `socket2` 创建套接字并开启 `SO_REUSEADDR`，设为非阻塞后交给 Tokio；
- 工作循环以 `tokio::select!` 同时等待邻居模块的报文、套接字数据报与停止信号。
"#]

use std::{
    borrow::Cow,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use pppoat_core::{
    Conf, Driver, DriverFactory, Error as CoreError, ModuleIo, ModuleKind, Packet,
    Result as CoreResult, base64,
};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;

/// 驱动名，同时是 `pipeline.transport` 的取值。
pub const NAME: &str = "udp";

pub const HOST_KEY: &str = "udp.host";
pub const PORT_KEY: &str = "udp.port";
pub const SRC_PORT_KEY: &str = "udp.src_port";
pub const DST_PORT_KEY: &str = "udp.dst_port";
pub const BIND_KEY: &str = "udp.bind";
pub const MTU_KEY: &str = "udp.mtu";
pub const BASE64_KEY: &str = "udp.base64";

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MTU: usize = 1500;

/// UDP 驱动的错误。
#[derive(Debug, Error)]
pub enum UdpError {
    /// 缺少必需配置项。
    #[error("缺少必需配置项 {0}")]
    MissingKey(&'static str),
    /// 配置项取值非法。
    #[error("配置项 {key} 的取值 `{value}` 非法")]
    InvalidValue { key: &'static str, value: String },
    /// 对端主机名无法解析。
    #[error("无法解析对端地址 {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    /// 绑定失败。
    #[error("无法绑定 UDP 套接字到 {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// 查询本地地址失败。
    #[error("无法获取 UDP 套接字本地地址: {0}")]
    LocalAddr(#[source] io::Error),
    /// 接收失败。
    #[error("接收 UDP 报文失败: {0}")]
    Receive(#[source] io::Error),
    /// 发送失败。
    #[error("发送 UDP 报文失败: {0}")]
    Send(#[source] io::Error),
    /// Base64 模式下收到的文本帧非法。
    #[error("收到非法文本帧（{len} 字节）: {reason}")]
    Malformed { len: usize, reason: String },
}

impl From<UdpError> for CoreError {
    fn from(err: UdpError) -> Self {
        match err {
            UdpError::MissingKey(_) | UdpError::InvalidValue { .. } => {
                CoreError::init(NAME, err.to_string())
            }
            UdpError::Resolve { .. } | UdpError::Bind { .. } | UdpError::LocalAddr(_) => {
                CoreError::start(NAME, err)
            }
            UdpError::Receive(source) | UdpError::Send(source) => CoreError::Io(source),
            UdpError::Malformed { .. } => CoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        }
    }
}

/// 从配置中解析出的 UDP 传输参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpConfig {
    pub host: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub bind: IpAddr,
    pub mtu: usize,
    pub base64: bool,
}

impl UdpConfig {
    /// 读取 `udp.*` 配置项。
    pub fn from_conf(conf: &Conf) -> Result<Self, UdpError> {
        let host = conf
            .find_string(HOST_KEY)
            .filter(|host| !host.trim().is_empty())
            .ok_or(UdpError::MissingKey(HOST_KEY))?;
        let port = parse_key(conf, PORT_KEY)?.unwrap_or(DEFAULT_PORT);
        let mtu = parse_key(conf, MTU_KEY)?.unwrap_or(DEFAULT_MTU);
        if mtu == 0 {
            return Err(UdpError::InvalidValue {
                key: MTU_KEY,
                value: "0".to_owned(),
            });
        }
        Ok(Self {
            host: host.trim().to_owned(),
            src_port: parse_key(conf, SRC_PORT_KEY)?.unwrap_or(port),
            dst_port: parse_key(conf, DST_PORT_KEY)?.unwrap_or(port),
            bind: parse_key(conf, BIND_KEY)?.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            mtu,
            base64: conf.find_bool(BASE64_KEY),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.src_port)
    }

    /// 单个数据报在线路上的最大长度。
    pub fn wire_len(&self) -> usize {
        if self.base64 {
            base64::encoded_len(self.mtu)
        } else {
            self.mtu
        }
    }
}

fn parse_key<T: std::str::FromStr>(conf: &Conf, key: &'static str) -> Result<Option<T>, UdpError> {
    conf.find_parsed::<T>(key).map_err(|_| UdpError::InvalidValue {
        key,
        value: conf.find_string(key).unwrap_or_default(),
    })
}

/// UDP 套接字的可选参数集合。
///
/// # 契约（What）
/// - `reuse_address`：绑定前是否开启 `SO_REUSEADDR`，默认开启，便于隧道重启时立即复用端口。
#[derive(Clone, Debug)]
pub struct UdpSocketOptions {
    reuse_address: bool,
}

impl Default for UdpSocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
        }
    }
}

impl UdpSocketOptions {
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn reuse_address(&self) -> bool {
        self.reuse_address
    }

    fn apply(&self, socket: &Socket) -> io::Result<()> {
        socket.set_reuse_address(self.reuse_address)?;
        socket.set_nonblocking(true)
    }
}

/// 按 `options` 创建并绑定 Tokio UDP 套接字，须在 Tokio 运行时内调用。
pub fn bind_socket(addr: SocketAddr, options: &UdpSocketOptions) -> Result<UdpSocket, UdpError> {
    let bind_err = |source| UdpError::Bind { addr, source };
    let socket =
        Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    options.apply(&socket).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

/// 把帧编码为文本帧，追加到 `out`。
pub fn encode_frame(payload: &[u8], out: &mut String) {
    base64::encode_into(payload, out);
}

/// 校验并解码文本帧。
pub fn decode_frame(datagram: &[u8]) -> Result<Vec<u8>, UdpError> {
    let malformed = |reason: &str| UdpError::Malformed {
        len: datagram.len(),
        reason: reason.to_owned(),
    };
    let text = std::str::from_utf8(datagram).map_err(|_| malformed("不是 UTF-8 文本"))?;
    if !base64::is_valid(text) {
        return Err(malformed("不是合法的 Base64"));
    }
    base64::decode(text).map_err(|err| malformed(&err.to_string()))
}

/// 运行期计数。
#[derive(Debug, Default)]
pub struct UdpCounters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub foreign: AtomicU64,
    pub malformed: AtomicU64,
    pub dropped: AtomicU64,
}

impl UdpCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// UDP 传输驱动。
pub struct UdpTransport {
    config: UdpConfig,
    options: UdpSocketOptions,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    counters: Arc<UdpCounters>,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        Self::with_counters(config, Arc::default())
    }

    pub fn with_counters(config: UdpConfig, counters: Arc<UdpCounters>) -> Self {
        Self {
            config,
            options: UdpSocketOptions::default(),
            socket: None,
            peer: None,
            counters,
        }
    }

    pub fn config(&self) -> &UdpConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<Option<SocketAddr>, UdpError> {
        self.socket
            .as_ref()
            .map(|socket| socket.local_addr().map_err(UdpError::LocalAddr))
            .transpose()
    }

    async fn resolve_peer(&self) -> Result<SocketAddr, UdpError> {
        let host = self.config.host.as_str();
        let resolve_err = |source| UdpError::Resolve {
            host: host.to_owned(),
            source,
        };
        let candidates = tokio::net::lookup_host((host, self.config.dst_port))
            .await
            .map_err(resolve_err)?;
        let want_v4 = self.config.bind.is_ipv4();
        let mut fallback = None;
        for candidate in candidates {
            if candidate.is_ipv4() == want_v4 {
                return Ok(candidate);
            }
            fallback.get_or_insert(candidate);
        }
        fallback.ok_or_else(|| {
            resolve_err(io::Error::new(io::ErrorKind::NotFound, "没有可用地址"))
        })
    }

    async fn send_frame(
        &self,
        socket: &UdpSocket,
        peer: SocketAddr,
        packet: &Packet,
        text: &mut String,
    ) -> Result<(), UdpError> {
        let wire = if self.config.base64 {
            text.clear();
            encode_frame(packet.as_slice(), text);
            text.as_bytes()
        } else {
            packet.as_slice()
        };
        socket.send_to(wire, peer).await.map_err(UdpError::Send)?;
        UdpCounters::bump(&self.counters.sent);
        Ok(())
    }

    async fn accept(
        &self,
        io: &ModuleIo,
        datagram: &[u8],
        from: SocketAddr,
        peer: SocketAddr,
    ) -> CoreResult<()> {
        if from != peer {
            UdpCounters::bump(&self.counters.foreign);
            tracing::warn!(%from, expected = %peer, "datagram from foreign source dropped");
            return Ok(());
        }
        let payload = if self.config.base64 {
            match decode_frame(datagram) {
                Ok(frame) => Cow::Owned(frame),
                Err(err) => {
                    UdpCounters::bump(&self.counters.malformed);
                    tracing::warn!(error = %err, "malformed frame dropped");
                    return Ok(());
                }
            }
        } else {
            Cow::Borrowed(datagram)
        };
        let packet = match io.alloc_from(&payload) {
            Ok(packet) => packet,
            Err(err) => {
                UdpCounters::bump(&self.counters.dropped);
                tracing::warn!(error = %err, len = payload.len(), "no packet available, frame dropped");
                return Ok(());
            }
        };
        match io.try_emit(packet).await? {
            None => UdpCounters::bump(&self.counters.received),
            Some(packet) => {
                UdpCounters::bump(&self.counters.dropped);
                tracing::warn!(len = packet.len(), "neighbour queue full, frame dropped");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for UdpTransport {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Transport
    }

    async fn start(&mut self) -> CoreResult<()> {
        let peer = self.resolve_peer().await?;
        let socket = bind_socket(self.config.local_addr(), &self.options)?;
        let local = socket.local_addr().map_err(UdpError::LocalAddr)?;
        tracing::info!(
            %local,
            %peer,
            base64 = self.config.base64,
            "udp transport bound"
        );
        self.peer = Some(peer);
        self.socket = Some(socket);
        Ok(())
    }

    async fn serve(&mut self, io: &ModuleIo) -> CoreResult<()> {
        let (Some(socket), Some(peer)) = (self.socket.as_ref(), self.peer) else {
            return Err(CoreError::Closed);
        };
        let wire_len = self.config.wire_len();
        // 多留一个字节，超长数据报才能与恰好 `wire_len` 的数据报区分开。
        let mut datagram = vec![0u8; wire_len + 1];
        let mut text = String::with_capacity(wire_len);
        loop {
            tokio::select! {
                _ = io.stopped() => return Ok(()),
                outbound = io.recv() => {
                    let packet = outbound?;
                    self.send_frame(socket, peer, &packet, &mut text).await?;
                }
                inbound = socket.recv_from(&mut datagram) => {
                    match inbound {
                        Ok((len, from)) if len > wire_len => {
                            UdpCounters::bump(&self.counters.dropped);
                            tracing::warn!(%from, limit = wire_len, "oversized datagram dropped");
                        }
                        Ok((len, from)) => self.accept(io, &datagram[..len], from, peer).await?,
                        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                            tracing::debug!("peer port unreachable");
                        }
                        Err(err) => return Err(UdpError::Receive(err).into()),
                    }
                }
            }
        }
    }

    async fn stop(&mut self) -> CoreResult<()> {
        if self.socket.take().is_some() {
            tracing::debug!(
                sent = self.counters.sent.load(Ordering::Relaxed),
                received = self.counters.received.load(Ordering::Relaxed),
                "udp socket closed"
            );
        }
        Ok(())
    }

    fn finalize(&mut self) {
        self.peer = None;
    }
}

/// UDP 驱动工厂。
#[derive(Clone, Debug, Default)]
pub struct UdpFactory {
    counters: Arc<UdpCounters>,
}

impl UdpFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本工厂创建的全部驱动共享的计数。
    pub fn counters(&self) -> &Arc<UdpCounters> {
        &self.counters
    }
}

impl DriverFactory for UdpFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Transport
    }

    fn init(&self, conf: &Conf) -> CoreResult<Box<dyn Driver>> {
        let config = UdpConfig::from_conf(conf)?;
        tracing::debug!(?config, "udp transport configured");
        Ok(Box::new(UdpTransport::with_counters(
            config,
            Arc::clone(&self.counters),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(pairs: &[&str]) -> Conf {
        let conf = Conf::new();
        conf.read_pairs(pairs).expect("测试参数格式正确");
        conf
    }

    #[test]
    fn host_is_required() {
        let err = UdpConfig::from_conf(&conf(&["udp.port=7000"])).expect_err("缺少 host 必须失败");
        assert!(matches!(err, UdpError::MissingKey(HOST_KEY)));
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::Init { .. }));
    }

    #[test]
    fn shared_port_with_overrides() {
        let config = UdpConfig::from_conf(&conf(&[
            "udp.host=198.51.100.4",
            "udp.port=7000",
            "udp.dst_port=7001",
        ]))
        .expect("合法配置");
        assert_eq!(config.src_port, 7000);
        assert_eq!(config.dst_port, 7001);
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert!(!config.base64);
    }

    #[test]
    fn defaults_apply() {
        let config = UdpConfig::from_conf(&conf(&["udp.host=peer.example"])).expect("合法配置");
        assert_eq!((config.src_port, config.dst_port), (DEFAULT_PORT, DEFAULT_PORT));
        assert_eq!(config.wire_len(), DEFAULT_MTU);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for pairs in [
            &["udp.host=h", "udp.port=70000"][..],
            &["udp.host=h", "udp.bind=not-an-ip"][..],
            &["udp.host=h", "udp.mtu=0"][..],
        ] {
            let err = UdpConfig::from_conf(&conf(pairs)).expect_err("非法取值必须失败");
            assert!(matches!(err, UdpError::InvalidValue { .. }), "{pairs:?}: {err}");
        }
    }

    #[test]
    fn base64_mode_expands_wire_len() {
        let config =
            UdpConfig::from_conf(&conf(&["udp.host=h", "udp.base64=yes", "udp.mtu=3"])).expect("合法配置");
        assert!(config.base64);
        assert_eq!(config.wire_len(), 4);
    }

    #[test]
    fn text_frames() {
        let mut text = String::new();
        encode_frame(b"hello", &mut text);
        assert_eq!(text, "aGVsbG8=");
        assert_eq!(decode_frame(text.as_bytes()).expect("合法文本帧"), b"hello");
        assert!(matches!(decode_frame(b"aGVsbG8"), Err(UdpError::Malformed { len: 7, .. })));
        assert!(matches!(decode_frame(&[0xff, 0xfe, 0x41, 0x41]), Err(UdpError::Malformed { .. })));
    }

    #[tokio::test]
    async fn bind_socket_on_ephemeral_port() {
        let socket = bind_socket(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            &UdpSocketOptions::default(),
        )
        .expect("本地回环地址应可绑定");
        let local = socket.local_addr().expect("查询本地地址");
        assert_ne!(local.port(), 0);
        assert!(UdpSocketOptions::default().reuse_address());
    }

    #[tokio::test]
    async fn unresolvable_peer_fails_start() {
        let config = UdpConfig::from_conf(&conf(&["udp.host=host.invalid", "udp.port=0"]))
            .expect("合法配置");
        let mut transport = UdpTransport::new(config);
        let err = transport.start().await.expect_err("无法解析的主机必须启动失败");
        assert!(matches!(err, CoreError::Start { .. }));
        assert!(transport.local_addr().expect("未绑定时查询不会失败").is_none());
    }
}
