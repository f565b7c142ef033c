//! Gateway metadata attached to every stats event.
//!
//! Two flat string maps: `static` values straight from the
//! configuration, and `dynamic` values produced by periodically
//! running configured shell commands (e.g. reading a temperature
//! sensor). Readers take a lock-free snapshot; only the single
//! refresh task writes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::config::MetadataConfig;

pub struct Metadata {
    static_map: HashMap<String, String>,
    dynamic_map: ArcSwap<HashMap<String, String>>,
    commands: HashMap<String, String>,
    max_execution_duration: Duration,
}

impl Metadata {
    /// Build from configuration and start the periodic refresh task.
    pub fn setup(conf: &MetadataConfig) -> Arc<Metadata> {
        let metadata = Arc::new(Metadata {
            static_map: conf.static_map.clone(),
            dynamic_map: ArcSwap::from_pointee(HashMap::new()),
            commands: conf.dynamic.commands.clone(),
            max_execution_duration: conf.dynamic.max_execution_duration,
        });

        if !metadata.commands.is_empty() {
            let m = metadata.clone();
            let interval = conf.dynamic.execution_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    m.refresh().await;
                }
            });
        }

        metadata
    }

    /// Union of static and dynamic values, dynamic winning on collision.
    pub fn get(&self) -> HashMap<String, String> {
        let mut out = self.static_map.clone();
        for (k, v) in self.dynamic_map.load().iter() {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    async fn refresh(&self) {
        let mut out = HashMap::with_capacity(self.commands.len());

        for (key, cmd) in &self.commands {
            match self.execute(cmd).await {
                Ok(value) => {
                    debug!(key = %key, value = %value, "metadata: dynamic value refreshed");
                    out.insert(key.clone(), value);
                }
                Err(e) => {
                    error!(key = %key, cmd = %cmd, error = %e, "metadata: command execution failed");
                }
            }
        }

        self.dynamic_map.store(Arc::new(out));
    }

    async fn execute(&self, cmd: &str) -> anyhow::Result<String> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let output =
            match tokio::time::timeout(self.max_execution_duration, child.wait_with_output()).await
            {
                Ok(result) => result?,
                Err(_) => {
                    warn!(cmd = %cmd, "metadata: command timed out");
                    anyhow::bail!("command timed out after {:?}", self.max_execution_duration);
                }
            };

        if !output.status.success() {
            anyhow::bail!("command exited with {}", output.status);
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
