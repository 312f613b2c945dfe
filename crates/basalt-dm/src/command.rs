//! Execution wrapper for the block-device tools.
//!
//! Shell integration stays here so the provider logic can be exercised with
//! fake binaries and deterministic stdout parsing.

use basalt_core::error::{BasaltError, BasaltResult};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    name: &'static str,
    binary: Option<PathBuf>,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl Output {
    pub(crate) fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr, fall back to stdout.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

impl ToolCommand {
    pub(crate) fn new(name: &'static str, binary: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            name,
            binary,
            timeout,
        }
    }

    /// Run the tool and fail unless it exits 0. `action` names the operation
    /// in the error message.
    pub(crate) fn run_checked(
        &self,
        action: &str,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> BasaltResult<Output> {
        let out = self.run(args, input)?;
        if out.success() {
            return Ok(out);
        }
        Err(BasaltError::Provider(format!(
            "{} (exit code {})",
            classify_failure(self.name, action, &out.diagnostic()),
            out.status
        )))
    }

    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> BasaltResult<Output> {
        let binary = self.binary.as_ref().ok_or_else(|| {
            BasaltError::Provider(format!(
                "unable to locate {} binary; set its path in the [mapper] section",
                self.name
            ))
        })?;

        let mut command = Command::new(binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;

        // Readers first: a tool may fill its output pipes before draining stdin.
        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());
        let stdin_handle = match (input, child.stdin.take()) {
            (Some(payload), Some(stdin)) => Some(spawn_input_writer(stdin, payload)),
            _ => None,
        };

        self.wait_with_timeout(child, stdout_handle, stderr_handle, stdin_handle)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_handle: thread::JoinHandle<BasaltResult<String>>,
        stderr_handle: thread::JoinHandle<BasaltResult<String>>,
        stdin_handle: Option<thread::JoinHandle<io::Result<()>>>,
    ) -> BasaltResult<Output> {
        let start = Instant::now();
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BasaltError::Provider(format!(
                "{} timed out after {:?}",
                self.name, self.timeout
            )));
        };

        if let Some(handle) = stdin_handle {
            handle
                .join()
                .map_err(|_| BasaltError::Provider("stdin writer thread panicked".into()))??;
        }
        let stdout = stdout_handle
            .join()
            .map_err(|_| BasaltError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| BasaltError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

fn classify_failure(tool: &str, action: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = if diagnostic.is_empty() {
        "no additional output"
    } else {
        diagnostic
    };

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "{tool} could not {action}: {diagnostic}. This usually requires elevated privileges (run as root)"
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot find")
        || lower.contains("not found")
    {
        return format!(
            "{tool} could not {action}: {diagnostic}. Confirm the image or device is present"
        );
    }

    if lower.contains("device or resource busy") || lower.contains("already exists") {
        return format!("{tool} could not {action} because the target is in use: {diagnostic}");
    }

    format!("{tool} failed to {action}: {diagnostic}")
}

/// Feed `payload` to the child and close its stdin. A child that exits
/// without reading everything is not an error here; its exit status says
/// what happened.
fn spawn_input_writer(
    mut stdin: ChildStdin,
    payload: &[u8],
) -> thread::JoinHandle<io::Result<()>> {
    let payload = Zeroizing::new(payload.to_vec());
    thread::spawn(move || match stdin.write_all(&payload) {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    })
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<BasaltResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> BasaltResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}
