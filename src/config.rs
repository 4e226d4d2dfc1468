use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logger::{LogConfig, LogLevel};
use crate::server::default_max_connections;

/// 配置文件（JSON）
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// PAC 文件路径，内容原样通过 `/pac` 提供
    pub pac_file: PathBuf,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 拨号（含 SOCKS5 握手）超时，0 表示不限时
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 隧道空闲超时，缺省时不限时
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub log: LogConfigFile,
}

/// 外部 PAC 求值程序
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorConfig {
    #[serde(default = "default_evaluator_program")]
    pub program: String,
    /// 放在 `-p/-u/-h` 之前的额外参数
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: default_evaluator_program(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputKind {
    Stdout,
    File,
    Both,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfigFile {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_output")]
    pub output: LogOutputKind,
    /// output 为 file 或 both 时使用
    pub file_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default)]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
}

impl Default for LogConfigFile {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            show_timestamp: true,
            show_module: false,
            use_color: true,
        }
    }
}

impl LogConfigFile {
    pub fn to_log_config(&self) -> LogConfig {
        let config = LogConfig::new(self.level)
            .with_timestamp(self.show_timestamp)
            .with_module(self.show_module)
            .with_color(self.use_color);

        let file_path = self
            .file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("logs/pac-proxy.log"));
        match self.output {
            LogOutputKind::Stdout => config,
            LogOutputKind::File => config.with_file(file_path),
            LogOutputKind::Both => config.with_both(file_path),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8228))
}

fn default_evaluator_program() -> String {
    "pactester".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_output() -> LogOutputKind {
    LogOutputKind::Stdout
}

fn default_true() -> bool {
    true
}

impl Config {
    /// 读取并校验配置文件
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("解析配置文件失败: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pac_file.as_os_str().is_empty() {
            bail!("pac_file 不能为空");
        }
        if self.evaluator.program.trim().is_empty() {
            bail!("evaluator.program 不能为空");
        }
        if self.max_connections == 0 {
            bail!("max_connections 必须大于 0");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs 必须大于 0");
        }
        if self.idle_timeout_secs == Some(0) {
            bail!("idle_timeout_secs 必须大于 0（不限时请省略该字段）");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
