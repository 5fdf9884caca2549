//! Launching a provider as a child process speaking over its stdio.

use std::io;
use std::process::Stdio;

use stepwise_core::provider::{ToolProviderConfig, TransportError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

pub(crate) struct Process {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

pub(crate) fn spawn(config: &ToolProviderConfig) -> Result<Process, TransportError> {
    info!("spawning provider {}: {} {:?}", config.name, config.command, config.args);

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| launch_error(&config.command, &err))?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
        return Err(TransportError::Launch("stdio is not piped".to_owned()));
    };

    if let Some(stderr) = child.stderr.take() {
        let name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[{name}] {line}");
            }
        });
    }

    Ok(Process {
        child,
        stdin,
        stdout,
    })
}

fn launch_error(command: &str, err: &io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::NotFound {
        TransportError::Launch(format!("command not found: {command}"))
    } else {
        TransportError::Launch(format!("failed to spawn {command}: {err}"))
    }
}
