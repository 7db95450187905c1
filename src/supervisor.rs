//! `kubectl proxy` supervisor.
//!
//! One supervisor task per tunnel runs `kubectl proxy --context <ctx> -p 0`
//! and lets the OS pick the port. The port is discovered from the
//! `Starting to serve on 127.0.0.1:<port>` line on stdout and published on a
//! `watch` channel (once per process run). Stderr lines are recorded as the
//! tunnel's `kubectlProxyError` but never kill the process.
//!
//! When the child exits on its own it is restarted after a fixed delay, so a
//! proxy that crashes on startup cannot spin. Firing the tunnel's exit token
//! cancels a pending restart and SIGKILLs the live child.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tunnel::{KubectlProxyStatus, StatusReporter, TunnelPatch};

/// How to launch `kubectl`. `leading_args` go before `proxy --context ...`;
/// empty for a real kubectl binary.
#[derive(Debug, Clone)]
pub struct ProxyCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ProxyCommand {
    pub fn kubectl(program: &str) -> Self {
        Self {
            program: program.to_string(),
            leading_args: Vec::new(),
        }
    }

    fn build(&self, context: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(["proxy", "--context", context, "-p", "0"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// How a single run of the child ended.
enum RunOutcome {
    /// Exit token fired; child was killed.
    Cancelled,
    /// Child could not be started.
    SpawnFailed,
    /// Child exited on its own.
    Exited(std::io::Result<ExitStatus>),
}

/// Extract the port from kubectl's startup line,
/// e.g. `Starting to serve on 127.0.0.1:38291`.
pub fn parse_serving_port(line: &str) -> Option<u16> {
    let line = line.trim();
    if !line.starts_with("Starting") {
        return None;
    }
    let (_, tail) = line.rsplit_once(':')?;
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok().filter(|p| *p != 0)
}

/// Run the supervisor loop until `exit` fires.
pub async fn run(
    command: ProxyCommand,
    context: String,
    restart_delay: Duration,
    reporter: StatusReporter,
    port_tx: watch::Sender<Option<u16>>,
    exit: CancellationToken,
) {
    let tunnel = reporter.id();
    let context = context.as_str();

    loop {
        let started = Instant::now();
        let outcome = run_once(&command, context, &reporter, &port_tx, &exit).await;

        match outcome {
            RunOutcome::Cancelled => {
                reporter
                    .report(TunnelPatch::kubectl_status(KubectlProxyStatus::Stopped))
                    .await;
                info!(tunnel, context, "kubectl proxy stopped");
                return;
            }
            RunOutcome::SpawnFailed => {}
            RunOutcome::Exited(Ok(status)) => {
                warn!(
                    tunnel,
                    context,
                    "kubectl proxy exited: {status} (uptime {:.1}s)",
                    started.elapsed().as_secs_f64()
                );
            }
            RunOutcome::Exited(Err(e)) => {
                warn!(tunnel, context, "kubectl proxy wait error: {e}");
            }
        }

        reporter
            .report(TunnelPatch::kubectl_status(KubectlProxyStatus::Stopped))
            .await;

        if exit.is_cancelled() {
            return;
        }
        info!(
            tunnel,
            context,
            "Restarting kubectl proxy in {}ms",
            restart_delay.as_millis()
        );
        tokio::select! {
            () = exit.cancelled() => {
                debug!(tunnel, "Pending kubectl proxy restart cancelled");
                return;
            }
            () = tokio::time::sleep(restart_delay) => {}
        }
    }
}

async fn run_once(
    command: &ProxyCommand,
    context: &str,
    reporter: &StatusReporter,
    port_tx: &watch::Sender<Option<u16>>,
    exit: &CancellationToken,
) -> RunOutcome {
    let tunnel = reporter.id();

    let mut child = match command.build(context).spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(tunnel, context, "Failed to spawn {}: {e}", command.program);
            reporter
                .report(TunnelPatch::kubectl_error(format!(
                    "failed to spawn {}: {e}",
                    command.program
                )))
                .await;
            return RunOutcome::SpawnFailed;
        }
    };
    debug!(tunnel, context, pid = ?child.id(), "kubectl proxy spawned");

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        kill(&mut child, tunnel).await;
        return RunOutcome::SpawnFailed;
    };
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut port_announced = false;
    let mut saw_stderr = false;

    // The run is over once both pipes are closed; then reap the child.
    while stdout_open || stderr_open {
        tokio::select! {
            () = exit.cancelled() => {
                kill(&mut child, tunnel).await;
                return RunOutcome::Cancelled;
            }
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => {
                    let mut patch = TunnelPatch::kubectl_status(KubectlProxyStatus::Running);
                    if !port_announced {
                        if let Some(port) = parse_serving_port(&line) {
                            port_announced = true;
                            info!(tunnel, context, port, "kubectl proxy serving");
                            port_tx.send_replace(Some(port));
                            patch.kubectl_proxy_error = Some(String::new());
                        }
                    }
                    reporter.report(patch).await;
                }
                Ok(None) | Err(_) => stdout_open = false,
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => {
                    debug!(tunnel, context, "kubectl proxy stderr: {line}");
                    saw_stderr = true;
                    reporter.report(TunnelPatch::kubectl_error(line)).await;
                }
                Ok(None) | Err(_) => stderr_open = false,
            },
        }
    }

    let status = tokio::select! {
        () = exit.cancelled() => {
            kill(&mut child, tunnel).await;
            return RunOutcome::Cancelled;
        }
        status = child.wait() => status,
    };

    if let Ok(ref s) = status {
        if !s.success() && !saw_stderr {
            reporter
                .report(TunnelPatch::kubectl_error(format!("kubectl proxy exited: {s}")))
                .await;
        }
    }
    RunOutcome::Exited(status)
}

async fn kill(child: &mut Child, tunnel: &str) {
    if let Err(e) = child.kill().await {
        debug!(tunnel, "kubectl proxy kill: {e}");
    }
}
