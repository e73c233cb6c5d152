use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Column, ConnectOptions, Row, SqliteConnection};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use taskhub_domain::entities::{OutputStream, Step, StepKind};
use taskhub_errors::{HubError, HubResult};

use crate::params::apply_placeholders;

/// 步骤产生的一行输出，由编排器编seq后经日志通道落库
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl StepOutcome {
    pub fn ok(exit_code: Option<i32>) -> Self {
        Self {
            success: true,
            exit_code,
            error_message: None,
        }
    }
    pub fn failed<S: Into<String>>(exit_code: Option<i32>, message: S) -> Self {
        Self {
            success: false,
            exit_code,
            error_message: Some(message.into()),
        }
    }
}

/// 单个步骤的执行上下文；config中的{{key}}占位符已可用params代入
pub struct StepContext {
    pub run_id: i64,
    pub step: Step,
    pub params: HashMap<String, String>,
    pub work_dir: PathBuf,
    pub python_bin: String,
}

impl StepContext {
    /// 解析步骤config为具体执行器的参数结构，字符串字段先做占位符代入
    pub fn parse_config<T: serde::de::DeserializeOwned>(&self) -> HubResult<T> {
        let raw = serde_json::to_string(&self.step.config)?;
        let substituted = apply_placeholders(&raw, &self.params);
        serde_json::from_str(&substituted).map_err(|e| {
            HubError::InvalidStepConfig(format!(
                "步骤 {} ({}) 配置无效: {e}",
                self.step.id, self.step.kind
            ))
        })
    }
}

/// 步骤执行器契约
///
/// execute在步骤结束前持续向output发送行；cancel尽力终止进程，
/// 不保证进程立即退出，编排器在宽限期后自行记录终态。
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn kind(&self) -> StepKind;
    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> HubResult<StepOutcome>;
    async fn cancel(&self, run_id: i64, step_id: i64) -> HubResult<()> {
        let _ = (run_id, step_id);
        Ok(())
    }
}

type PidMap = Arc<RwLock<HashMap<(i64, i64), u32>>>;

/// 子进程型执行器共用的spawn、流式读取与pid登记
async fn run_streaming_command(
    mut cmd: Command,
    key: (i64, i64),
    pids: &PidMap,
    output: mpsc::Sender<OutputLine>,
) -> HubResult<StepOutcome> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| HubError::execution_error(format!("启动子进程失败: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HubError::execution_error("无法获取stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| HubError::execution_error("无法获取stderr"))?;

    if let Some(pid) = child.id() {
        pids.write().await.insert(key, pid);
    }

    let out_tx = output.clone();
    let stdout_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if out_tx
                .send(OutputLine {
                    stream: OutputStream::Stdout,
                    line,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });
    let err_tx = output;
    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if err_tx
                .send(OutputLine {
                    stream: OutputStream::Stderr,
                    line,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let _ = tokio::join!(stdout_task, stderr_task);
    let exit_status = child
        .wait()
        .await
        .map_err(|e| HubError::execution_error(format!("等待子进程结束失败: {e}")));

    pids.write().await.remove(&key);
    let exit_status = exit_status?;

    let exit_code = exit_status.code();
    if exit_status.success() {
        Ok(StepOutcome::ok(exit_code))
    } else {
        Ok(StepOutcome::failed(
            exit_code,
            format!("子进程退出码: {exit_code:?}"),
        ))
    }
}

async fn kill_registered(key: (i64, i64), pids: &PidMap) -> HubResult<()> {
    let pid = pids.write().await.remove(&key);
    if let Some(pid) = pid {
        info!("终止步骤子进程: run={} step={} pid={}", key.0, key.1, pid);
        #[cfg(unix)]
        {
            let status = Command::new("kill")
                .arg(pid.to_string())
                .status()
                .await
                .map_err(|e| HubError::execution_error(format!("执行kill失败: {e}")))?;
            if !status.success() {
                warn!("kill {} 返回非零状态", pid);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// shell

#[derive(Debug, Deserialize)]
struct ShellConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Shell步骤执行器：子进程执行，stdout/stderr逐行流式上报
pub struct ShellExecutor {
    pids: PidMap,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            pids: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Shell
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> HubResult<StepOutcome> {
        let config: ShellConfig = ctx.parse_config()?;
        debug!(
            "执行shell步骤: run={} step={} command={}",
            ctx.run_id, ctx.step.id, config.command
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        match &config.working_dir {
            Some(dir) => {
                cmd.current_dir(dir);
            }
            None => {
                cmd.current_dir(&ctx.work_dir);
            }
        }
        // 解析后的运行参数以环境变量形式暴露给脚本
        for (key, value) in &ctx.params {
            cmd.env(key, value);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        run_streaming_command(cmd, (ctx.run_id, ctx.step.id), &self.pids, output).await
    }

    async fn cancel(&self, run_id: i64, step_id: i64) -> HubResult<()> {
        kill_registered((run_id, step_id), &self.pids).await
    }
}

// ---------------------------------------------------------------------------
// python

#[derive(Debug, Deserialize)]
struct PythonConfig {
    script: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Python步骤执行器：脚本写入临时文件后由配置的解释器执行
pub struct PythonExecutor {
    pids: PidMap,
}

impl PythonExecutor {
    pub fn new() -> Self {
        Self {
            pids: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for PythonExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for PythonExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Python
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> HubResult<StepOutcome> {
        let config: PythonConfig = ctx.parse_config()?;

        let script_file = tempfile::Builder::new()
            .prefix(&format!("taskhub-run{}-step{}-", ctx.run_id, ctx.step.id))
            .suffix(".py")
            .tempfile_in(&ctx.work_dir)
            .map_err(|e| HubError::execution_error(format!("创建脚本临时文件失败: {e}")))?;
        let mut file = tokio::fs::File::create(script_file.path())
            .await
            .map_err(|e| HubError::execution_error(format!("写入脚本失败: {e}")))?;
        file.write_all(config.script.as_bytes())
            .await
            .map_err(|e| HubError::execution_error(format!("写入脚本失败: {e}")))?;
        file.flush()
            .await
            .map_err(|e| HubError::execution_error(format!("写入脚本失败: {e}")))?;

        let mut cmd = Command::new(&ctx.python_bin);
        cmd.arg(script_file.path());
        cmd.args(&config.args);
        cmd.current_dir(&ctx.work_dir);
        for (key, value) in &ctx.params {
            cmd.env(key, value);
        }

        // script_file在作用域内保活，进程结束后自动清理
        let outcome =
            run_streaming_command(cmd, (ctx.run_id, ctx.step.id), &self.pids, output).await;
        drop(script_file);
        outcome
    }

    async fn cancel(&self, run_id: i64, step_id: i64) -> HubResult<()> {
        kill_registered((run_id, step_id), &self.pids).await
    }
}

// ---------------------------------------------------------------------------
// sql

#[derive(Debug, Deserialize)]
struct SqlConfig {
    /// SQLite数据库路径或sqlite:// URL
    database: String,
    query: String,
    #[serde(default = "default_delimiter")]
    delimiter: String,
    /// 首行输出列名
    #[serde(default = "default_true")]
    header: bool,
}

fn default_delimiter() -> String {
    ",".to_string()
}
fn default_true() -> bool {
    true
}

/// SQL抽取执行器：内置SQLite查询，结果按分隔行流式输出
pub struct SqlExecutor;

impl SqlExecutor {
    pub fn new() -> Self {
        Self
    }

    fn value_to_string(row: &sqlx::sqlite::SqliteRow, index: usize) -> String {
        if let Ok(value) = row.try_get::<Option<String>, _>(index) {
            return value.unwrap_or_default();
        }
        if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
            return value.map(|v| v.to_string()).unwrap_or_default();
        }
        if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
            return value.map(|v| v.to_string()).unwrap_or_default();
        }
        String::new()
    }
}

impl Default for SqlExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for SqlExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Sql
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> HubResult<StepOutcome> {
        let config: SqlConfig = ctx.parse_config()?;

        let url = if config.database.starts_with("sqlite:") {
            config.database.clone()
        } else {
            format!("sqlite://{}", config.database)
        };
        let options: SqliteConnectOptions = url
            .parse()
            .map_err(|e| HubError::InvalidStepConfig(format!("无效的数据库地址: {e}")))?;
        let mut conn: SqliteConnection = options
            .connect()
            .await
            .map_err(|e| HubError::execution_error(format!("连接数据库失败: {e}")))?;

        let rows = sqlx::query(&config.query)
            .fetch_all(&mut conn)
            .await
            .map_err(|e| HubError::execution_error(format!("查询执行失败: {e}")))?;

        let mut emitted = 0usize;
        if let Some(first) = rows.first() {
            if config.header {
                let header = first
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect::<Vec<_>>()
                    .join(&config.delimiter);
                let _ = output
                    .send(OutputLine {
                        stream: OutputStream::Stdout,
                        line: header,
                    })
                    .await;
            }
        }
        for row in &rows {
            let line = (0..row.columns().len())
                .map(|i| Self::value_to_string(row, i))
                .collect::<Vec<_>>()
                .join(&config.delimiter);
            if output
                .send(OutputLine {
                    stream: OutputStream::Stdout,
                    line,
                })
                .await
                .is_err()
            {
                break;
            }
            emitted += 1;
        }

        info!(
            "SQL步骤完成: run={} step={} 输出{}行",
            ctx.run_id, ctx.step.id, emitted
        );
        Ok(StepOutcome::ok(Some(0)))
    }
}

// ---------------------------------------------------------------------------
// http

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP步骤执行器：请求并捕获响应
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for HttpExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Http
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> HubResult<StepOutcome> {
        let config: HttpConfig = ctx.parse_config()?;

        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| HubError::InvalidStepConfig(format!("无效的HTTP方法: {}", config.method)))?;
        let mut request = self.client.request(method, &config.url);
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }
        if let Some(body) = &config.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| HubError::execution_error(format!("HTTP请求失败: {e}")))?;
        let status = response.status();
        let _ = output
            .send(OutputLine {
                stream: OutputStream::Stdout,
                line: format!("HTTP {}", status),
            })
            .await;

        let body = response
            .text()
            .await
            .map_err(|e| HubError::execution_error(format!("读取响应失败: {e}")))?;
        for line in body.lines() {
            if output
                .send(OutputLine {
                    stream: OutputStream::Stdout,
                    line: line.to_string(),
                })
                .await
                .is_err()
            {
                break;
            }
        }

        if status.is_success() {
            Ok(StepOutcome::ok(Some(0)))
        } else {
            Ok(StepOutcome::failed(
                None,
                format!("HTTP状态码 {}", status.as_u16()),
            ))
        }
    }
}
