use anyhow::{Context, Result};
use pac_proxy::logger::{init_from_env, init_logger};
use pac_proxy::{CommandEvaluator, Config, Dialer, PacDocument, PacProxy};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = Config::load(&config_path)?;

    // 设置了 RUST_LOG 时以环境变量为准，忽略配置文件中的 log 段
    if std::env::var_os("RUST_LOG").is_some() {
        init_from_env().context("初始化日志系统失败")?;
    } else {
        init_logger(config.log.to_log_config()).context("初始化日志系统失败")?;
    }

    log::info!("=== PAC 代理启动 ===");
    log::info!("配置文件: {}", config_path);

    let pac = PacDocument::from_file(&config.pac_file)?;
    log::info!("已加载 PAC 文件 {} ({} 字节)", pac.name(), pac.source().len());

    let evaluator = CommandEvaluator::new(&config.evaluator.program, &config.pac_file)
        .with_args(config.evaluator.args.clone());
    log::info!("PAC 求值程序: {}", config.evaluator.program);

    match config.connect_timeout() {
        Some(limit) => log::info!("连接超时: {:?}", limit),
        None => log::info!("连接超时: 无"),
    }

    let proxy = PacProxy::new(config.listen_addr, pac, Box::new(evaluator))
        .with_dialer(Dialer::new().with_connect_timeout(config.connect_timeout()))
        .with_max_connections(config.max_connections)
        .with_idle_timeout(config.idle_timeout())
        .with_request_timeout(config.request_timeout());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    log::info!("=== 服务器准备就绪 ===");
    proxy.run_with_shutdown(Some(shutdown_rx)).await
}
