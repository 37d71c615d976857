//! What every chat surface needs from the core: submit a prompt in a
//! conversation, reset it, and stop a run in flight.

use anyhow::Result;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::agent::{AgentReply, AgentRunner, ProcessHandle, RunObserver, RunRegistry};
use crate::config::MemoryConfig;
use crate::memory::Memory;
use crate::progress::ProgressNotifier;
use crate::store::JsonFile;
use crate::workspace::SessionMap;

/// Registers the run's process under its conversation key and forwards tool
/// signals to the progress worker.
struct SubmitObserver<'a> {
    registry: &'a RunRegistry,
    key: &'a str,
    handle: std::sync::Mutex<Option<ProcessHandle>>,
    progress: Option<&'a ProgressNotifier>,
}

impl RunObserver for SubmitObserver<'_> {
    fn on_process(&self, handle: ProcessHandle) {
        self.registry.insert(self.key, handle.clone());
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    fn on_tool(&self, name: &str, _input: &Value) {
        if let Some(progress) = self.progress {
            progress.push_tool(name);
        }
    }
}

impl SubmitObserver<'_> {
    /// Drops the run from the registry. Returns whether it was stopped.
    fn deregister(&self) -> bool {
        let handle = self.handle.lock().ok().and_then(|mut slot| slot.take());
        match handle {
            Some(handle) => {
                self.registry.remove(self.key, &handle);
                handle.is_stopped()
            }
            None => false,
        }
    }
}

/// Conversations on one chat surface, each with its own agent session.
#[derive(Clone)]
pub struct Conversations {
    runner: AgentRunner,
    sessions: JsonFile<SessionMap>,
    registry: RunRegistry,
    memory: Memory,
    recall: MemoryConfig,
    working_dir: PathBuf,
}

impl Conversations {
    pub fn new(
        runner: AgentRunner,
        sessions: JsonFile<SessionMap>,
        memory: Memory,
        recall: MemoryConfig,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            sessions,
            registry: RunRegistry::new(),
            memory,
            recall,
            working_dir,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub async fn session(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        Ok(self
            .sessions
            .load_async()
            .await?
            .remove(&key)
            .filter(|id| !id.is_empty()))
    }

    /// Runs `prompt` in the conversation `key`. The progress worker, when
    /// given, is always stopped before this returns.
    pub async fn submit(
        &self,
        key: &str,
        prompt: &str,
        progress: Option<ProgressNotifier>,
    ) -> Result<AgentReply> {
        let result = self.submit_inner(key, prompt, progress.as_ref()).await;
        if let Some(progress) = progress {
            progress.finish().await;
        }
        result
    }

    async fn submit_inner(
        &self,
        key: &str,
        prompt: &str,
        progress: Option<&ProgressNotifier>,
    ) -> Result<AgentReply> {
        let prior = self.session(key).await?;

        let prompt = match &prior {
            Some(_) => prompt.to_string(),
            None => self.with_recall(prompt).await,
        };

        let observer = SubmitObserver {
            registry: &self.registry,
            key,
            handle: std::sync::Mutex::new(None),
            progress,
        };
        let result = self
            .runner
            .run(
                &prompt,
                prior.as_deref(),
                &self.working_dir,
                self.runner.config().timeout(),
                &observer,
            )
            .await;
        let stopped = observer.deregister();
        let reply = result?;
        if stopped {
            // A stop may be followed by a reset; the old session must stay gone.
            info!(key, "Run was stopped, session left unchanged");
            return Ok(reply);
        }

        if let Some(id) = reply.session_id.clone() {
            if prior.as_deref() != Some(id.as_str()) {
                info!(key, session = %id, "Session updated");
            }
            let key = key.to_string();
            self.sessions
                .update_if_changed_async(move |map| {
                    let changed = map.get(&key) != Some(&id);
                    if changed {
                        map.insert(key, id);
                    }
                    ((), changed)
                })
                .await?;
        }
        Ok(reply)
    }

    async fn with_recall(&self, prompt: &str) -> String {
        if !self.recall.recall {
            return prompt.to_string();
        }
        let memory = self.memory.clone();
        let query = prompt.to_string();
        let (max_results, max_chars) = (self.recall.max_results, self.recall.max_context_chars);
        let recalled = tokio::task::spawn_blocking(move || memory.recall(&query, max_results, max_chars)).await;
        match recalled {
            Ok(Some(context)) => {
                debug!("Prepended {} chars of memory context", context.len());
                format!("{}\n\n{}", context, prompt)
            }
            Ok(None) => prompt.to_string(),
            Err(e) => {
                warn!("Memory recall failed: {}", e);
                prompt.to_string()
            }
        }
    }

    /// Forgets the conversation's session; the next prompt starts fresh.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.sessions
            .update_if_changed_async(move |map| ((), map.remove(&key).is_some()))
            .await?;
        Ok(())
    }

    /// Stops the conversation's run, if any.
    pub fn stop(&self, key: &str) -> bool {
        self.registry.stop(key)
    }
}
