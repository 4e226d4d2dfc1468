use anyhow::{Context, Result};
use bytes::Bytes;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// 启动时加载的 PAC 脚本，加载后只读
#[derive(Debug, Clone)]
pub struct PacDocument {
    /// 脚本来源（文件路径），从内存加载时为空
    path: Option<PathBuf>,
    /// 原始脚本内容
    source: Bytes,
}

impl PacDocument {
    /// 从文件加载 PAC 脚本
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read(path).with_context(|| format!("无法读取 PAC 文件: {}", path.display()))?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            source: Bytes::from(source),
        })
    }

    /// 直接从字节加载 PAC 脚本
    pub fn from_bytes(source: impl Into<Bytes>) -> Self {
        Self {
            path: None,
            source: source.into(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn source(&self) -> &Bytes {
        &self.source
    }

    /// 用于日志的名称
    pub fn name(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "<inline>".to_string(),
        }
    }

    /// `/pac` 控制端点的响应体：原始脚本加一个换行
    pub fn served_body(&self) -> Bytes {
        let mut body = Vec::with_capacity(self.source.len() + 1);
        body.extend_from_slice(&self.source);
        body.push(b'\n');
        Bytes::from(body)
    }
}

/// PAC 求值能力
///
/// 给定 (url, host) 返回代理配置字符串，例如 `"DIRECT"` 或 `"PROXY 10.0.0.1:3128"`。
/// 求值器不可重入，`&mut self` 保证同一时刻只有一个调用在执行。
pub trait PacEvaluator: Send {
    fn find_proxy(&mut self, url: &str, host: &str) -> Result<String>;
}

impl<F> PacEvaluator for F
where
    F: FnMut(&str, &str) -> Result<String> + Send,
{
    fn find_proxy(&mut self, url: &str, host: &str) -> Result<String> {
        self(url, host)
    }
}

/// 调用外部 PAC 测试程序（默认 `pactester`）进行求值
///
/// 命令行格式: `<program> <args..> -p <pac_file> -u <url> -h <host>`
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
    pac_file: PathBuf,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, pac_file: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            pac_file: pac_file.into(),
        }
    }

    /// 设置放在 PAC 参数之前的额外参数
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl PacEvaluator for CommandEvaluator {
    fn find_proxy(&mut self, url: &str, host: &str) -> Result<String> {
        debug!("执行 {} 求值: url={} host={}", self.program, url, host);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("-p")
            .arg(&self.pac_file)
            .arg("-u")
            .arg(url)
            .arg("-h")
            .arg(host)
            .output()
            .with_context(|| format!("无法执行 PAC 求值程序 {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "PAC 求值程序 {} 退出状态 {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("PAC 求值程序输出不是有效的 UTF-8")?;
        Ok(stdout.trim().to_string())
    }
}
