//! Subprocess plumbing for CLI-backed engine and orchestrator clients.

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::types::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Run to completion and capture output. Non-zero exit is a `Backend` error
/// carrying stderr, or `NotFound` when the tool reports a missing object.
pub async fn run(program: &str, args: &[String]) -> Result<ExecOutput> {
    let output = run_unchecked(program, args).await?;
    if output.exit_code == Some(0) {
        return Ok(output);
    }
    let message = format!(
        "{} {} failed ({:?}): {}",
        program,
        args.first().map(String::as_str).unwrap_or(""),
        output.exit_code,
        output.stderr.trim()
    );
    let lowered = output.stderr.to_lowercase();
    if lowered.contains("no such") || lowered.contains("notfound") || lowered.contains("not found") {
        Err(Error::not_found(message))
    } else {
        Err(Error::backend(message))
    }
}

/// Run to completion, returning output regardless of exit status.
pub async fn run_unchecked(program: &str, args: &[String]) -> Result<ExecOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::backend(format!("cannot run {}: {}", program, e)))?;
    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}

/// Spawn and stream stdout in chunks. The stream ends with an error item if
/// the command exits non-zero.
pub fn stream_stdout(program: &str, args: &[String]) -> Result<BoxStream<'static, Result<Bytes>>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::backend(format!("cannot run {}: {}", program, e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::internal("child stdout was not captured"))?;
    let label = program.to_string();

    struct State {
        stdout: ChildStdout,
        child: Child,
        label: String,
        done: bool,
    }

    let state = State {
        stdout,
        child,
        label,
        done: false,
    };
    let stream = futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match state.stdout.read_buf(&mut buf).await {
            Ok(0) => {
                state.done = true;
                match state.child.wait().await {
                    Ok(status) if status.success() => None,
                    Ok(status) => {
                        let err = Error::backend(format!("{} exited with {}", state.label, status));
                        Some((Err(err), state))
                    }
                    Err(e) => Some((Err(Error::Io(e)), state)),
                }
            }
            Ok(_) => Some((Ok(buf.freeze()), state)),
            Err(e) => {
                state.done = true;
                Some((Err(Error::Io(e)), state))
            }
        }
    });
    Ok(stream.boxed())
}

/// Drain a byte stream, failing once more than `limit` bytes arrive.
pub async fn collect_limited(mut stream: BoxStream<'static, Result<Bytes>>, limit: u64) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(Error::validation(format!(
                "too large archive exceeding {} bytes",
                limit
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
