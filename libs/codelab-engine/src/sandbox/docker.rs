/// Docker Isolation Backend
///
/// **Container Rules:**
/// 1. Pulls the language image if not present
/// 2. Creates one throwaway container per execution:
///    - Network disabled
///    - Memory (no swap), CPU share and pids limits enforced by cgroups
///    - Read-only root filesystem; the program works in a tmpfs at /sandbox
///    - All capabilities dropped, no privilege escalation, unprivileged user
/// 3. Injects scratch files and stdin through base64 environment variables
/// 4. Captures stdout/stderr streams up to their caps
/// 5. Terminates on wall timeout, output overflow or cancellation
/// 6. Removes the container afterwards, even on panic or cancellation
///
/// Environment strings are bounded by the kernel's per-string argument limit,
/// so scratch files and stdin must each stay below roughly 96KB.
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Invocation, IsolationBoundary, RawExecutionOutcome, SandboxError};
use crate::cancel::CancelSignal;
use crate::config::LanguageConfigManager;
use crate::limits::{LimitBreach, ResourceLimits};

const SANDBOX_DIR: &str = "/sandbox";
const SANDBOX_TMPFS_MB: u64 = 64;
const SANDBOX_USER: &str = "65534:65534";
const STDIN_ENV: &str = "CODELAB_STDIN";
const FILE_ENV_PREFIX: &str = "CODELAB_FILE_";

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Drop cannot be async; hand removal to the runtime if one is still around
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime to remove container");
            return;
        };
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        runtime.spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

pub struct DockerSandbox {
    docker: Docker,
    config_manager: LanguageConfigManager,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon; images come from `config_manager`
    pub fn new_with_config(config_manager: &LanguageConfigManager) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker daemon: {}", e))?;

        Ok(DockerSandbox {
            docker,
            config_manager: config_manager.clone(),
        })
    }

    fn image_for(&self, invocation: &Invocation) -> Result<String, SandboxError> {
        if let Some(image) = &invocation.image {
            return Ok(image.clone());
        }
        self.config_manager
            .get_config(&invocation.language)
            .map(|config| config.image.clone())
            .map_err(|e| SandboxError::SetupFailed(e.to_string()))
    }

    /// Ensure the image is available locally, pulling it on a cache miss
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                SandboxError::SetupFailed(format!("image '{}' unavailable: {}", image, e))
            })?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn kill(&self, container_id: &str, signal: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, Some(KillContainerOptions { signal }))
            .await
        {
            // Already exited containers reject kills
            debug!(container_id, signal, error = %e, "Kill request failed");
        }
    }

    async fn wait_exit(&self, container_id: &str) {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));
        // Non-zero exits surface as errors here; the exit code is read from inspect
        let _ = stream.next().await;
    }

    async fn stop(&self, container_id: &str, breach: LimitBreach, grace: Duration) {
        if breach == LimitBreach::Cancelled {
            self.kill(container_id, "SIGTERM").await;
            if tokio::time::timeout(grace, self.wait_exit(container_id)).await.is_ok() {
                return;
            }
        }
        self.kill(container_id, "SIGKILL").await;
        self.wait_exit(container_id).await;
    }

    /// Stream logs into `captured` until the container exits or stdout overflows.
    /// Returns true on overflow.
    async fn collect_logs(&self, container_id: &str, limits: &ResourceLimits, captured: &mut CapturedLogs) -> bool {
        let options = Some(LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        });
        let mut logs = self.docker.logs(container_id, options);

        while let Some(item) = logs.next().await {
            match item {
                Ok(LogOutput::StdOut { message }) => {
                    if !push_capped(&mut captured.stdout, &message, limits.output_bytes) {
                        captured.stdout_truncated = true;
                        return true;
                    }
                }
                Ok(LogOutput::StdErr { message }) => {
                    push_capped(&mut captured.stderr, &message, limits.stderr_bytes);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct CapturedLogs {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: bool,
}

/// Append up to `cap` total bytes; false if anything was dropped
fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    if chunk.len() > room {
        buf.extend_from_slice(&chunk[..room]);
        false
    } else {
        buf.extend_from_slice(chunk);
        true
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn container_env(invocation: &Invocation, stdin: &str) -> Vec<String> {
    let mut env: Vec<String> = invocation
        .files
        .iter()
        .enumerate()
        .map(|(i, file)| {
            format!(
                "{}{}={}",
                FILE_ENV_PREFIX,
                i,
                general_purpose::STANDARD.encode(&file.contents)
            )
        })
        .collect();
    env.push(format!("{}={}", STDIN_ENV, general_purpose::STANDARD.encode(stdin)));
    env.push(format!("HOME={}", SANDBOX_DIR));
    env.push(format!("TMPDIR={}", SANDBOX_DIR));
    env.push("LANG=C.UTF-8".to_string());
    env.extend(invocation.env.iter().map(|(k, v)| format!("{}={}", k, v)));
    env
}

/// Shell entrypoint: materialise files and stdin in the tmpfs, drop the
/// payload variables, apply the CPU ulimit and exec the program
fn entry_script(invocation: &Invocation, cpu_secs: u64) -> String {
    let mut script = format!("set -e\ncd {}\n", SANDBOX_DIR);
    let mut payload_vars = Vec::new();

    for (i, file) in invocation.files.iter().enumerate() {
        let var = format!("{}{}", FILE_ENV_PREFIX, i);
        script.push_str(&format!(
            "printf '%s' \"${}\" | base64 -d > {}\n",
            var,
            shell_quote(&file.name)
        ));
        payload_vars.push(var);
    }
    script.push_str(&format!("printf '%s' \"${}\" | base64 -d > .stdin\n", STDIN_ENV));
    payload_vars.push(STDIN_ENV.to_string());

    script.push_str(&format!("unset {}\n", payload_vars.join(" ")));
    script.push_str(&format!("ulimit -t {}\n", cpu_secs));

    let command: Vec<String> = invocation.command_line().iter().map(|s| shell_quote(s)).collect();
    script.push_str(&format!("exec {} < .stdin\n", command.join(" ")));
    script
}

/// Split a container exit code into (exit code, signal)
fn decode_exit(code: i64) -> (Option<i32>, Option<i32>) {
    if (129..160).contains(&code) {
        (None, Some((code - 128) as i32))
    } else {
        (Some(code as i32), None)
    }
}

#[async_trait]
impl IsolationBoundary for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[tracing::instrument(skip_all, fields(language = %invocation.language))]
    async fn run(
        &self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        mut cancel: CancelSignal,
    ) -> Result<RawExecutionOutcome, SandboxError> {
        let image = self.image_for(invocation)?;
        self.ensure_image(&image).await?;

        let memory_bytes = limits.memory_bytes() as i64;
        let cpu_share = invocation.cpu_share.unwrap_or(1.0);

        let config = Config {
            image: Some(image.clone()),
            entrypoint: Some(vec!["/bin/sh".to_string()]),
            cmd: Some(vec![
                "-c".to_string(),
                entry_script(invocation, limits.cpu_rlimit_secs()),
            ]),
            env: Some(container_env(invocation, stdin)),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(SANDBOX_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some((cpu_share as f64 * 1_000_000_000.0) as i64),
                pids_limit: Some(limits.max_processes as i64),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([(
                    SANDBOX_DIR.to_string(),
                    format!("rw,exec,nosuid,size={}m,mode=1777", SANDBOX_TMPFS_MB),
                )])),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("codelab-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::SetupFailed(format!("failed to create container: {}", e)))?;
        let container_id = container.id.clone();

        // Set up the guard before anything else can fail
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::SetupFailed(format!("failed to start container: {}", e)))?;

        let mut captured = CapturedLogs::default();
        let breach = {
            let collect = self.collect_logs(&container_id, limits, &mut captured);
            tokio::pin!(collect);
            tokio::select! {
                overflowed = &mut collect => overflowed.then_some(LimitBreach::OutputSize),
                _ = tokio::time::sleep(limits.wall_time()) => Some(LimitBreach::WallTime),
                _ = cancel.cancelled() => Some(LimitBreach::Cancelled),
            }
        };

        match breach {
            Some(breach) => self.stop(&container_id, breach, limits.grace_period()).await,
            None => self.wait_exit(&container_id).await,
        }
        let wall_time_ms = start_time.elapsed().as_millis() as u64;

        let state = self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::SetupFailed(format!("failed to inspect container: {}", e)))?
            .state
            .unwrap_or_default();

        let oom_killed = state.oom_killed.unwrap_or(false);
        let (exit_code, signal) = state.exit_code.map(decode_exit).unwrap_or((None, None));
        let breach = breach.or(oom_killed.then_some(LimitBreach::Memory));

        debug!(
            container_id = %container_id,
            exit_code = ?exit_code,
            signal = ?signal,
            breach = ?breach,
            wall_time_ms,
            "Container finished"
        );

        Ok(RawExecutionOutcome {
            stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&captured.stderr).into_owned(),
            exit_code,
            signal,
            wall_time_ms,
            cpu_time_ms: None,
            peak_memory_kb: None,
            breach,
            stdout_truncated: captured.stdout_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::Language;

    #[test]
    fn test_entry_script_materialises_files_and_stdin() {
        let invocation = Invocation::new(Language::Python, "python3")
            .with_args(["-I", "main.py"])
            .with_file("main.py", "print(input())");

        let script = entry_script(&invocation, 3);

        assert!(script.starts_with("set -e\ncd /sandbox\n"));
        assert!(script.contains("printf '%s' \"$CODELAB_FILE_0\" | base64 -d > 'main.py'\n"));
        assert!(script.contains("printf '%s' \"$CODELAB_STDIN\" | base64 -d > .stdin\n"));
        assert!(script.contains("unset CODELAB_FILE_0 CODELAB_STDIN\n"));
        assert!(script.contains("ulimit -t 3\n"));
        assert!(script.ends_with("exec 'python3' '-I' 'main.py' < .stdin\n"));
    }

    #[test]
    fn test_container_env_encodes_payloads() {
        let invocation = Invocation::new(Language::Sql, "sqlite3")
            .with_file("main.sql", "SELECT 1;")
            .with_env("SQLITE_TMPDIR", "/sandbox");

        let env = container_env(&invocation, "a b\n");

        assert!(env.contains(&format!("CODELAB_FILE_0={}", general_purpose::STANDARD.encode("SELECT 1;"))));
        assert!(env.contains(&format!("CODELAB_STDIN={}", general_purpose::STANDARD.encode("a b\n"))));
        assert!(env.contains(&"SQLITE_TMPDIR=/sandbox".to_string()));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_decode_exit() {
        assert_eq!(decode_exit(0), (Some(0), None));
        assert_eq!(decode_exit(1), (Some(1), None));
        assert_eq!(decode_exit(137), (None, Some(9)));
        assert_eq!(decode_exit(152), (None, Some(24)));
    }

    #[test]
    fn test_push_capped() {
        let mut buf = Vec::new();
        assert!(push_capped(&mut buf, b"abc", 5));
        assert!(!push_capped(&mut buf, b"def", 5));
        assert_eq!(buf, b"abcde");
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_container_echo() {
        let manager = LanguageConfigManager::builtin();
        let sandbox = DockerSandbox::new_with_config(&manager).unwrap();
        let invocation = Invocation::new(Language::Python, "python3")
            .with_args(["-I", "main.py"])
            .with_file("main.py", "print(input())");

        let outcome = sandbox
            .run(&invocation, "hello\n", &ResourceLimits::default(), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.exit_code, Some(0));
    }
}
