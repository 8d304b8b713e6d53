use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,wms_relay_core=debug";

static INSTALLED: OnceCell<()> = OnceCell::new();

/**
 * \brief 安装全局 tracing 订阅者；重复调用无副作用。
 * \param json 是否输出 JSON 结构化日志
 */
pub fn init(json: bool) {
    INSTALLED.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);
        let result = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if let Err(err) = result {
            eprintln!("tracing init skipped: {}", err);
        }
    });
}

/**
 * \brief 查询订阅者是否已由本模块安装。
 */
pub fn is_installed() -> bool {
    INSTALLED.get().is_some()
}
