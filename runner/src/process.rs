use std::{
    io::{self, Read},
    path::Path,
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("failed to spawn '{exe}'")]
    Spawn {
        exe: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{exe}' did not finish within {timeout:?}:\n{output}")]
    Timeout {
        exe: String,
        timeout: Duration,
        output: String,
    },
    #[error("'{exe}' exited with status {status}:\n{output}")]
    NonZeroExit {
        exe: String,
        status: i32,
        output: String,
    },
    #[error("failed to read output of a child process")]
    ChildIo(#[from] std::io::Error),
}

type Reader = thread::JoinHandle<io::Result<String>>;

/// invoke `exe` with `args` in `dir`, killing the child once `timeout` elapses
///
/// stdout and stderr are captured and returned as a single combined string;
/// a non-zero exit or a timeout carries the captured output in the error
pub fn call(
    exe: &Path,
    args: &[String],
    dir: &Path,
    timeout: Duration,
) -> Result<String, CallError> {
    let printable = exe.to_string_lossy().into_owned();

    debug!(exe = %printable, ?timeout, "invoking {printable} {args:?}");

    let mut child = Command::new(exe)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| CallError::Spawn {
            exe: printable.clone(),
            source,
        })?;

    // both pipes must be drained while waiting, a child filling the pipe
    // buffer would otherwise block and never exit
    let stdout = reader_thread(child.stdout.take());
    let stderr = reader_thread(child.stderr.take());

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let output = collect(stdout, stderr)?;

            trace!("output: {output}");

            if status.success() {
                Ok(output)
            } else {
                Err(CallError::NonZeroExit {
                    exe: printable,
                    status: status.code().unwrap_or(-1),
                    output,
                })
            }
        }
        None => {
            // child hasn't exited yet
            child.kill()?;
            let _ = child.wait();
            let output = collect(stdout, stderr).unwrap_or_default();

            Err(CallError::Timeout {
                exe: printable,
                timeout,
                output,
            })
        }
    }
}

fn reader_thread<R: Read + Send + 'static>(pipe: Option<R>) -> Reader {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn collect(stdout: Reader, stderr: Reader) -> Result<String, CallError> {
    let mut output = join(stdout)?;
    output.push_str(&join(stderr)?);

    Ok(output)
}

fn join(reader: Reader) -> Result<String, CallError> {
    match reader.join() {
        Ok(result) => Ok(result?),
        Err(_) => Ok(String::new()),
    }
}
