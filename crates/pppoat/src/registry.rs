//! 内置驱动注册表：按配置名选择接口与传输驱动。

use pppoat_core::{Conf, DriverFactory, ModuleKind};
use pppoat_if_pppd::PppdFactory;
use pppoat_transport_udp::UdpFactory;

pub const INTERFACE_KEY: &str = "pipeline.interface";
pub const TRANSPORT_KEY: &str = "pipeline.transport";

pub const DEFAULT_INTERFACE: &str = pppoat_if_pppd::NAME;
pub const DEFAULT_TRANSPORT: &str = pppoat_transport_udp::NAME;

/// 按名称查找驱动工厂，名称与角色不符时返回 `None`。
pub fn lookup(kind: ModuleKind, name: &str) -> Option<Box<dyn DriverFactory>> {
    let factory: Box<dyn DriverFactory> = match name {
        pppoat_if_pppd::NAME => Box::new(PppdFactory),
        pppoat_transport_udp::NAME => Box::new(UdpFactory::new()),
        _ => return None,
    };
    (factory.kind() == kind).then_some(factory)
}

/// 按角色读取 `pipeline.interface` 或 `pipeline.transport` 并查找工厂，未配置时取内置默认；
/// 查找失败时返回该名称。
pub fn select(conf: &Conf, kind: ModuleKind) -> Result<Box<dyn DriverFactory>, String> {
    let (key, default) = match kind {
        ModuleKind::Interface => (INTERFACE_KEY, DEFAULT_INTERFACE),
        ModuleKind::Transport => (TRANSPORT_KEY, DEFAULT_TRANSPORT),
    };
    let name = conf
        .find_string(key)
        .unwrap_or_else(|| default.to_owned());
    lookup(kind, name.trim()).ok_or(name)
}

/// 全部内置驱动名及其角色。
pub fn builtin() -> [(&'static str, ModuleKind); 2] {
    [
        (pppoat_if_pppd::NAME, ModuleKind::Interface),
        (pppoat_transport_udp::NAME, ModuleKind::Transport),
    ]
}
