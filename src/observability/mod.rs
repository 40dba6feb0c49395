//! 可观测性

use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// 日志级别句柄：配置加载完成后再调整级别
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    /// 设置了 RUST_LOG 时以环境变量为准，不再调整
    env_override: bool,
}

impl LogHandle {
    pub fn set_level(&self, level: &str) {
        if self.env_override {
            return;
        }
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if let Err(e) = self.reload.reload(filter) {
                    tracing::warn!(error = %e, "Failed to apply log level");
                }
            }
            Err(e) => tracing::warn!(level, error = %e, "Invalid log level, keeping current filter"),
        }
    }
}

/// 初始化日志：RUST_LOG 优先，否则使用 default_level；应在加载配置之前调用
pub fn init(default_level: &str) -> LogHandle {
    let from_env = EnvFilter::try_from_default_env().ok();
    let env_override = from_env.is_some();
    let filter = from_env
        .or_else(|| EnvFilter::try_new(default_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let (filter, reload) = reload::Layer::new(filter);

    // 重复初始化（如同一进程多次调用）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();

    LogHandle {
        reload,
        env_override,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_applies_after_init() {
        let handle = init("warn");
        if handle.env_override {
            return;
        }
        assert!(!tracing::enabled!(tracing::Level::DEBUG));
        handle.set_level("debug");
        assert!(tracing::enabled!(tracing::Level::DEBUG));
    }
}
