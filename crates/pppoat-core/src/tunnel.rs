//! 隧道会话：一次完整的启动与拆除编排。
//!
//! # 契约说明（What）
//! - [`Tunnel::start`] 依次初始化、注册、启动全部模块，最后打开就绪闸门；
//!   任一步失败都会把已完成的步骤逆序撤销，返回时不残留任何运行中的模块；
//! - [`Tunnel::shutdown`] 消费会话：关闭闸门 → 逆序停止 → 注销（关闭队列）→ 释放，
//!   返回 [`TeardownReport`]。

use std::sync::Arc;

use crate::{
    context::Context,
    error::Result,
    module::{DriverFactory, Module, ModuleState, StateProbe},
};

/// 隧道会话。
pub struct Tunnel {
    ctx: Arc<Context>,
    modules: Vec<Module>,
}

/// 拆除结果：按流水线顺序列出模块名与最终状态。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownReport {
    pub modules: Vec<(String, ModuleState)>,
}

impl TeardownReport {
    /// 所有模块是否都已进入 FINALIZED。
    pub fn is_clean(&self) -> bool {
        self.modules
            .iter()
            .all(|(_, state)| *state == ModuleState::Finalized)
    }
}

impl Tunnel {
    /// 按 `factories` 的顺序（接口在前，传输在后）构建并启动流水线。
    pub async fn start(ctx: &Arc<Context>, factories: &[&dyn DriverFactory]) -> Result<Self> {
        let mut modules = Vec::with_capacity(factories.len());
        for factory in factories {
            match Module::init(*factory, ctx) {
                Ok(module) => modules.push(module),
                Err(err) => {
                    for module in modules.into_iter().rev() {
                        module.finalize();
                    }
                    return Err(err);
                }
            }
        }

        let pipeline = ctx.pipeline();
        for module in &modules {
            pipeline.add_module(module);
        }

        for index in 0..modules.len() {
            if let Err(err) = modules[index].run().await {
                Self::rollback(ctx, modules, index).await;
                return Err(err);
            }
        }

        pipeline.set_ready(true);
        tracing::info!(modules = ?pipeline.module_names(), "tunnel started");
        Ok(Self {
            ctx: Arc::clone(ctx),
            modules,
        })
    }

    async fn rollback(ctx: &Context, mut modules: Vec<Module>, started: usize) {
        tracing::warn!(started, total = modules.len(), "startup failed, rolling back");
        for module in modules[..started].iter_mut().rev() {
            module.stop().await;
        }
        for module in modules.into_iter().rev() {
            ctx.pipeline().remove_module(module.id());
            module.finalize();
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// 拆除会话。停止阶段的驱动错误只记录日志。
    pub async fn shutdown(mut self) -> TeardownReport {
        let pipeline = Arc::clone(self.ctx.pipeline());
        pipeline.set_ready(false);

        for module in self.modules.iter_mut().rev() {
            module.stop().await;
        }

        let probes: Vec<(String, StateProbe)> = self
            .modules
            .iter()
            .map(|module| (module.name().to_owned(), module.probe()))
            .collect();
        for module in self.modules.drain(..).rev() {
            pipeline.remove_module(module.id());
            module.finalize();
        }

        let report = TeardownReport {
            modules: probes
                .into_iter()
                .map(|(name, probe)| (name, probe.get()))
                .collect(),
        };
        tracing::info!(clean = report.is_clean(), "tunnel torn down");
        report
    }
}
