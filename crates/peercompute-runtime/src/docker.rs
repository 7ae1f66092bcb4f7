//! Docker CLI implementation of the runtime port.
//!
//! Containers run non-privileged with all capabilities dropped, a pids
//! limit, cpu/memory bounds, and the declared port (if any) published on
//! 127.0.0.1 only. Ownership is recorded in labels so a crashed daemon can
//! find its containers on restart.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::policy::{is_forbidden_env, SecurityPolicy};
use crate::{
    ContainerSpec, ContainerStats, LogStream, ManagedContainer, RuntimeError, RuntimePort,
    RuntimeResult, DEPLOYMENT_ID_LABEL, MANAGED_LABEL, REQUESTER_ID_LABEL,
};

/// Back-off before the single retry on transient pull/stop failures.
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct DockerRuntime {
    docker: String,
    policy: SecurityPolicy,
}

impl DockerRuntime {
    pub fn new(policy: SecurityPolicy) -> Self {
        DockerRuntime {
            docker: "docker".to_string(),
            policy,
        }
    }

    async fn output(&self, args: &[&str]) -> RuntimeResult<String> {
        let out = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(RuntimeError::Inspect(stderr));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[async_trait]
impl RuntimePort for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        let out = Command::new(&self.docker)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::NotAvailable(e.to_string()))?;
        if !out.status.success() {
            return Err(RuntimeError::NotAvailable(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn pull(&self, image: &str, cancel: &CancellationToken) -> RuntimeResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut child = Command::new(&self.docker)
                .args(["pull", image])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;

            let status = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(RuntimeError::Cancelled);
                }
                status = child.wait() => status?,
            };

            if status.success() {
                debug!(image = %image, "Image pulled");
                return Ok(());
            }
            if attempt >= 2 {
                return Err(RuntimeError::Pull {
                    image: image.to_string(),
                    message: format!("docker pull exited with {status}"),
                });
            }
            warn!(image = %image, "Pull failed, retrying once");
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.policy.validate(spec)?;

        let cpus = format!("{:.3}", spec.cpu_millicores as f64 / 1000.0);
        let memory = spec.memory_bytes.to_string();
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--cpus".into(),
            cpus,
            "--memory".into(),
            memory,
            "--pids-limit".into(),
            "100".into(),
            "--security-opt".into(),
            "no-new-privileges:true".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--network".into(),
            "bridge".into(),
            "--label".into(),
            format!("{MANAGED_LABEL}=true"),
            "--label".into(),
            format!("{}={}", DEPLOYMENT_ID_LABEL, spec.deployment_id),
            "--label".into(),
            format!("{}={}", REQUESTER_ID_LABEL, spec.requester_id),
        ];

        if spec.expose_port > 0 {
            // Published to loopback only; the tunnel is the sole public path
            args.push("-p".into());
            args.push(format!(
                "127.0.0.1:{port}:{port}",
                port = spec.expose_port
            ));
        }

        for (key, value) in &spec.environment {
            if is_forbidden_env(key) {
                continue;
            }
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image.clone());

        let out = Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(RuntimeError::Start(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        let container_id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        debug!(container = %container_id, deployment = %spec.deployment_id, "Container started");
        Ok(container_id)
    }

    async fn stop(&self, handle: &str, timeout: Duration) -> RuntimeResult<()> {
        let secs = timeout.as_secs().to_string();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let stop = Command::new(&self.docker)
                .args(["stop", "-t", &secs, handle])
                .stdin(Stdio::null())
                .output()
                .await?;
            // `docker rm -f` covers containers that refused to stop
            let rm = Command::new(&self.docker)
                .args(["rm", "-f", handle])
                .stdin(Stdio::null())
                .output()
                .await?;

            if stop.status.success() || rm.status.success() {
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&rm.stderr);
            // Already gone counts as stopped
            if stderr.contains("No such container") {
                return Ok(());
            }
            if attempt >= 2 {
                return Err(RuntimeError::Stop(stderr.trim().to_string()));
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    async fn logs(
        &self,
        handle: &str,
        follow: bool,
        tail: Option<usize>,
    ) -> RuntimeResult<LogStream> {
        let mut args: Vec<String> = vec!["logs".into(), "--timestamps".into()];
        if follow {
            args.push("-f".into());
        }
        if let Some(n) = tail {
            args.push("--tail".into());
            args.push(n.to_string());
        }
        args.push(handle.to_string());

        let child = Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        LogStream::new(child)
    }

    async fn stats(&self, handle: &str) -> RuntimeResult<ContainerStats> {
        let line = self
            .output(&[
                "stats",
                "--no-stream",
                "--format",
                "{{.CPUPerc}}|{{.MemUsage}}",
                handle,
            ])
            .await?;
        parse_stats_line(&line)
            .ok_or_else(|| RuntimeError::Inspect(format!("unexpected stats output: {line}")))
    }

    async fn is_running(&self, handle: &str) -> RuntimeResult<bool> {
        match self
            .output(&["inspect", "--format", "{{.State.Running}}", handle])
            .await
        {
            Ok(state) => Ok(state == "true"),
            // A missing container is simply not running
            Err(RuntimeError::Inspect(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedContainer>> {
        let format = format!(
            "{{{{.ID}}}}|{{{{.Label \"{DEPLOYMENT_ID_LABEL}\"}}}}|{{{{.Label \"{REQUESTER_ID_LABEL}\"}}}}"
        );
        let filter = format!("label={MANAGED_LABEL}=true");
        let out = self
            .output(&["ps", "-a", "--filter", &filter, "--format", &format])
            .await?;

        let mut containers = Vec::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.splitn(3, '|');
            let id = match parts.next() {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => continue,
            };
            containers.push(ManagedContainer {
                id,
                deployment_id: parts.next().filter(|s| !s.is_empty()).map(String::from),
                requester_id: parts.next().filter(|s| !s.is_empty()).map(String::from),
            });
        }
        Ok(containers)
    }

    async fn cleanup_all(&self) -> RuntimeResult<()> {
        let containers = self.list_managed().await?;
        let mut last_err = None;
        for container in containers {
            if let Err(e) = self.stop(&container.id, crate::DEFAULT_STOP_TIMEOUT).await {
                warn!(container = %container.id, error = %e, "Cleanup failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Parse `docker stats` output of the form `0.52%|12.5MiB / 256MiB`.
fn parse_stats_line(line: &str) -> Option<ContainerStats> {
    let (cpu, mem) = line.split_once('|')?;
    let cpu_percent: f64 = cpu.trim().trim_end_matches('%').parse().ok()?;
    let (used, limit) = mem.split_once('/')?;
    Some(ContainerStats {
        cpu_percent,
        memory_bytes: parse_size(used.trim())?,
        memory_limit: parse_size(limit.trim())?,
    })
}

/// Parse docker's human sizes: `12.5MiB`, `1.2GiB`, `800KiB`, `64B`.
fn parse_size(s: &str) -> Option<u64> {
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = s.split_at(split);
    let value: f64 = num.trim().parse().ok()?;
    let multiplier: u64 = match unit.trim() {
        "B" => 1,
        "KiB" | "kB" | "KB" => 1024,
        "MiB" | "MB" => 1024 * 1024,
        "GiB" | "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats_line() {
        let stats = parse_stats_line("0.52%|12.5MiB / 256MiB").unwrap();
        assert!((stats.cpu_percent - 0.52).abs() < f64::EPSILON);
        assert_eq!(stats.memory_bytes, (12.5 * 1024.0 * 1024.0) as u64);
        assert_eq!(stats.memory_limit, 256 * 1024 * 1024);
    }

    #[test]
    fn test_parse_stats_rejects_garbage() {
        assert!(parse_stats_line("").is_none());
        assert!(parse_stats_line("nonsense").is_none());
        assert!(parse_stats_line("1%|nothing").is_none());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("64B"), Some(64));
        assert_eq!(parse_size("800KiB"), Some(800 * 1024));
        assert_eq!(parse_size("1GiB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("weird"), None);
    }
}
