pub mod events;
pub mod registry;

use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use events::{EventKind, Line};
pub use events::{AgentEvent, ToolInvocation};
pub use registry::{ProcessHandle, RunRegistry};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to start agent '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hooks into a running agent. Both are called from the task driving the run.
pub trait RunObserver: Send + Sync {
    /// Called once, right after the process has started.
    fn on_process(&self, _handle: ProcessHandle) {}

    /// Called once per distinct tool name in each event.
    fn on_tool(&self, _name: &str, _input: &Value) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub answer: String,
    pub session_id: Option<String>,
    /// Raw events that carried tool invocations, in order.
    pub tool_log: Vec<Value>,
    pub exit_code: Option<i32>,
}

/// Accumulates one run's output and decides the answer.
#[derive(Debug, Default)]
pub struct Transcript {
    chunks: Vec<String>,
    final_text: Option<String>,
    session_id: Option<String>,
    raw_lines: Vec<String>,
    tool_log: Vec<Value>,
}

impl Transcript {
    pub fn feed(&mut self, line: &str, observer: &dyn RunObserver) {
        let event = match events::parse_line(line) {
            Line::Blank => return,
            Line::Unparsed(raw) => {
                self.raw_lines.push(raw);
                return;
            }
            Line::Event(event) => event,
        };
        debug!(kind = ?event.kind, tools = event.tools.len(), "Agent event");

        if let Some(id) = &event.session_id {
            self.session_id = Some(id.clone());
        }
        if let Some(text) = event.text() {
            self.chunks.push(text.to_string());
            if event.kind == EventKind::Terminal {
                self.final_text = Some(text.to_string());
            }
        }
        if !event.tools.is_empty() {
            for tool in &event.tools {
                observer.on_tool(&tool.name, &tool.input);
            }
            self.tool_log.push(event.raw);
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn finish(self, stderr: &str, exit_code: Option<i32>) -> AgentReply {
        let answer = match self.final_text {
            Some(text) => text,
            None => self.chunks.concat().trim().to_string(),
        };
        let answer = if !answer.is_empty() {
            answer
        } else if !stderr.trim().is_empty() {
            format!("(no output)\n{}", stderr.trim())
        } else if !self.raw_lines.is_empty() {
            self.raw_lines.join("\n").trim().to_string()
        } else {
            match exit_code {
                Some(code) if code != 0 => format!("(no output) (exit {})", code),
                _ => "(no output)".to_string(),
            }
        };
        AgentReply {
            answer,
            session_id: self.session_id,
            tool_log: self.tool_log,
            exit_code,
        }
    }
}

/// Runs the external agent CLI.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    config: AgentConfig,
}

impl AgentRunner {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn command_args(&self, prompt: &str, session_id: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = ["-p", "--output-format", "stream-json", "--verbose"]
            .into_iter()
            .map(String::from)
            .collect();
        if self.config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args.push(prompt.to_string());
        args
    }

    /// Runs one prompt to completion. The timeout counts from launch; when it
    /// expires the process is killed and no partial answer is returned.
    pub async fn run(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        working_dir: &Path,
        timeout: Duration,
        observer: &dyn RunObserver,
    ) -> Result<AgentReply, AgentError> {
        let child = Command::new(&self.config.command)
            .args(self.command_args(prompt, session_id))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;
        info!(
            pid = ?child.id(),
            resume = session_id.is_some(),
            "Agent started"
        );
        drive(child, timeout, self.config.exit_grace(), observer).await
    }
}

/// Streams a spawned agent's stdout into a [`Transcript`] until EOF.
async fn drive(
    mut child: Child,
    timeout: Duration,
    exit_grace: Duration,
    observer: &dyn RunObserver,
) -> Result<AgentReply, AgentError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("agent stdout was not captured"))?;
    let stderr = child.stderr.take();

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            if let Err(e) = stderr.read_to_end(&mut buf).await {
                debug!("Failed to read agent stderr: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let cancel = CancellationToken::new();
    observer.on_process(ProcessHandle::new(child.id(), cancel.clone()));

    let mut reader = BufReader::new(stdout);
    let mut transcript = Transcript::default();
    let mut buf = Vec::new();
    let mut stopping = false;

    loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => {
                if read? == 0 {
                    break;
                }
                transcript.feed(&String::from_utf8_lossy(&buf), observer);
                buf.clear();
            }
            _ = cancel.cancelled(), if !stopping => {
                stopping = true;
                info!(pid = ?child.id(), "Agent run cancelled");
                if let Err(e) = child.start_kill() {
                    debug!("Agent already gone: {}", e);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(pid = ?child.id(), "Agent timed out after {:?}", timeout);
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill timed-out agent: {}", e);
                }
                stderr_task.abort();
                return Err(AgentError::Timeout(timeout));
            }
        }
    }
    if !buf.is_empty() {
        transcript.feed(&String::from_utf8_lossy(&buf), observer);
    }

    let status = match tokio::time::timeout(exit_grace, child.wait()).await {
        Ok(status) => Some(status?),
        Err(_) => {
            warn!(pid = ?child.id(), "Agent did not exit after closing stdout, killing");
            if let Err(e) = child.kill().await {
                debug!("Failed to kill agent: {}", e);
            }
            child.try_wait().ok().flatten()
        }
    };
    let exit_code = status.and_then(|s| s.code());

    let stderr_text = match tokio::time::timeout(exit_grace, stderr_task).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    };

    let reply = transcript.finish(&stderr_text, exit_code);
    info!(
        exit_code = ?reply.exit_code,
        session = ?reply.session_id,
        tools = reply.tool_log.len(),
        "Agent finished"
    );
    Ok(reply)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        tools: Mutex<Vec<String>>,
        handle: Mutex<Option<ProcessHandle>>,
        stop_on_tool: bool,
    }

    impl RunObserver for Recorder {
        fn on_process(&self, handle: ProcessHandle) {
            *self.handle.lock().unwrap() = Some(handle);
        }

        fn on_tool(&self, name: &str, _input: &Value) {
            self.tools.lock().unwrap().push(name.to_string());
            if self.stop_on_tool {
                if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                    handle.stop();
                }
            }
        }
    }

    fn fake_agent(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    async fn run_script(script: &str, observer: &dyn RunObserver) -> Result<AgentReply, AgentError> {
        drive(
            fake_agent(script),
            Duration::from_secs(10),
            Duration::from_secs(2),
            observer,
        )
        .await
    }

    #[test]
    fn command_line_shape() {
        let runner = AgentRunner::new(AgentConfig {
            extra_args: vec!["--model".into(), "opus".into()],
            ..AgentConfig::default()
        });
        assert_eq!(
            runner.command_args("hi", Some("s-1")),
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
                "--model",
                "opus",
                "--resume",
                "s-1",
                "hi"
            ]
        );
        let plain = AgentRunner::new(AgentConfig {
            skip_permissions: false,
            ..AgentConfig::default()
        });
        assert_eq!(plain.command_args("hi", None).last().map(String::as_str), Some("hi"));
        assert!(!plain.command_args("hi", None).contains(&"--resume".to_string()));
    }

    #[tokio::test]
    async fn concatenates_text_and_reports_tools() {
        let recorder = Recorder::default();
        let reply = run_script(
            r#"
echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo 'warming up'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello "},{"type":"tool_use","name":"Bash","input":{"command":"ls"}},{"type":"tool_use","name":"Bash","input":{}}]}}'
echo ''
echo '{"type":"content_block_delta","delta":{"text_delta":"world"}}'
"#,
            &recorder,
        )
        .await
        .unwrap();

        assert_eq!(reply.answer, "Hello world");
        assert_eq!(reply.session_id.as_deref(), Some("sess-1"));
        assert_eq!(reply.tool_log.len(), 1);
        assert_eq!(reply.exit_code, Some(0));
        assert_eq!(*recorder.tools.lock().unwrap(), vec!["Bash".to_string()]);
        assert!(recorder.handle.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_event_replaces_transcript() {
        let reply = run_script(
            r#"
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"thinking..."}]}}'
echo '{"type":"result","text":"Final answer"}'
"#,
            &NoopObserver,
        )
        .await
        .unwrap();
        assert_eq!(reply.answer, "Final answer");
    }

    #[tokio::test]
    async fn falls_back_to_stderr_then_raw_lines_then_exit_code() {
        let reply = run_script("echo 'auth failed' >&2; exit 3", &NoopObserver)
            .await
            .unwrap();
        assert_eq!(reply.answer, "(no output)\nauth failed");

        let reply = run_script("echo 'plain line one'; echo 'plain line two'", &NoopObserver)
            .await
            .unwrap();
        assert_eq!(reply.answer, "plain line one\nplain line two");

        let reply = run_script("exit 3", &NoopObserver).await.unwrap();
        assert_eq!(reply.answer, "(no output) (exit 3)");

        let reply = run_script("true", &NoopObserver).await.unwrap();
        assert_eq!(reply.answer, "(no output)");
    }

    #[tokio::test]
    async fn unparsable_lines_stay_out_of_a_real_answer() {
        let reply = run_script(
            r#"
echo 'debug noise'
echo '{"type":"assistant","text":"real"}'
"#,
            &NoopObserver,
        )
        .await
        .unwrap();
        assert_eq!(reply.answer, "real");
    }

    #[tokio::test]
    async fn timeout_kills_and_fails() {
        let started = std::time::Instant::now();
        let result = drive(
            fake_agent(r#"echo '{"type":"assistant","text":"partial"}'; exec sleep 30"#),
            Duration::from_millis(300),
            Duration::from_secs(2),
            &NoopObserver,
        )
        .await;
        assert!(matches!(result, Err(AgentError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stop_returns_partial_transcript() {
        let recorder = Recorder {
            stop_on_tool: true,
            ..Recorder::default()
        };
        let started = std::time::Instant::now();
        let reply = run_script(
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Partial"},{"type":"tool_use","name":"WebSearch"}]}}'; exec sleep 30"#,
            &recorder,
        )
        .await
        .unwrap();
        assert_eq!(reply.answer, "Partial");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn lingering_process_is_killed_after_exit_grace() {
        let started = std::time::Instant::now();
        let reply = drive(
            fake_agent(r#"echo '{"type":"assistant","text":"done"}'; exec >&- 2>&-; exec sleep 30"#),
            Duration::from_secs(10),
            Duration::from_millis(300),
            &NoopObserver,
        )
        .await
        .unwrap();
        assert_eq!(reply.answer, "done");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let runner = AgentRunner::new(AgentConfig {
            command: "/nonexistent/agent-binary".into(),
            ..AgentConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let result = runner
            .run("hi", None, dir.path(), Duration::from_secs(1), &NoopObserver)
            .await;
        assert!(matches!(result, Err(AgentError::Spawn { .. })));
    }
}
