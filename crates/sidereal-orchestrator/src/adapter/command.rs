//! Adapter driving an external PaaS command-line tool.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::AdapterConfig;
use crate::error::{AdapterError, AdapterResult, OrchestratorError, OrchestratorResult};
use crate::types::TargetId;

use super::{ControlPlaneAdapter, LogSink};

/// Values substituted into argument templates.
#[derive(Debug, Clone, Copy)]
struct Placeholders<'a> {
    target: &'a str,
    source: &'a str,
    tail: usize,
}

impl Placeholders<'_> {
    fn render(&self, template: &[String]) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                arg.replace("{target}", self.target)
                    .replace("{source}", self.source)
                    .replace("{tail}", &self.tail.to_string())
            })
            .filter(|arg| !arg.is_empty())
            .collect()
    }
}

/// Collects lines for operations whose output is the result.
#[derive(Debug, Default)]
struct CollectSink(Mutex<Vec<String>>);

impl LogSink for CollectSink {
    fn emit(&self, line: &str) {
        self.0.lock().push(line.to_owned());
    }
}

/// Runs one program invocation per operation step.
///
/// Stdout and stderr are forwarded line by line as they are produced. The
/// child is killed if the call times out or the calling task is dropped.
#[derive(Debug)]
pub struct CommandAdapter {
    config: AdapterConfig,
}

impl CommandAdapter {
    /// Create a new command adapter.
    pub fn new(config: AdapterConfig) -> OrchestratorResult<Self> {
        if config.program.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "adapter.program must not be empty".to_owned(),
            ));
        }
        if config.commands.deploy.is_empty() {
            return Err(OrchestratorError::Config(
                "adapter.commands.deploy must not be empty".to_owned(),
            ));
        }
        Ok(Self { config })
    }

    #[instrument(skip(self, template, logs), fields(program = %self.config.program))]
    async fn run(
        &self,
        step: &'static str,
        template: &[String],
        placeholders: Placeholders<'_>,
        logs: &dyn LogSink,
    ) -> AdapterResult<()> {
        let args = placeholders.render(template);
        debug!(?args, "spawning adapter command");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => AdapterError::permanent(
                    format!("cannot run {}: {e}", self.config.program),
                ),
                _ => AdapterError::transient(format!(
                    "failed to spawn {}: {e}",
                    self.config.program
                )),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let mut stdout = stdout.map(OutputLines::new);
            let mut stderr = stderr.map(OutputLines::new);

            // Forward from whichever stream has a line ready so interleaving
            // follows the program's output as closely as possible.
            while stdout.is_some() || stderr.is_some() {
                tokio::select! {
                    line = next_line(&mut stdout), if stdout.is_some() => match line {
                        Some(line) => logs.emit(&line),
                        None => stdout = None,
                    },
                    line = next_line(&mut stderr), if stderr.is_some() => match line {
                        Some(line) => logs.emit(&line),
                        None => stderr = None,
                    },
                }
            }

            child.wait().await
        };

        let limit = self.config.timeout();
        let outcome = timeout(limit, run).await;
        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(AdapterError::transient(format!(
                    "failed to wait for {}: {e}",
                    self.config.program
                )));
            }
            Err(_) => {
                warn!(step, ?limit, "adapter command timed out");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed out adapter command");
                }
                return Err(AdapterError::transient(format!(
                    "{step} timed out after {limit:?}"
                )));
            }
        };

        if status.success() {
            info!(step, "adapter command succeeded");
            return Ok(());
        }

        match status.code() {
            Some(code) if self.config.transient_exit_codes.contains(&code) => Err(
                AdapterError::transient(format!("{step} exited with status {code}")),
            ),
            Some(code) => Err(AdapterError::permanent(format!(
                "{step} exited with status {code}"
            ))),
            None => Err(AdapterError::transient(format!(
                "{step} terminated by signal"
            ))),
        }
    }
}

/// Splits a child's output stream into lines.
///
/// Bytes that are not valid UTF-8 are replaced rather than treated as the
/// end of the stream, so the pipe stays drained for the life of the child.
struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// The next line without its terminator, or `None` at end of output.
    ///
    /// Cancel safe: a partially read line stays buffered for the next call.
    async fn next(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(_) if self.buf.is_empty() => None,
            Ok(_) => {
                let line = decode_line(&self.buf);
                self.buf.clear();
                Some(line)
            }
            Err(e) => {
                warn!(error = %e, "failed to read adapter command output");
                None
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

async fn next_line<R>(lines: &mut Option<OutputLines<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next().await,
        None => None,
    }
}

#[async_trait]
impl ControlPlaneAdapter for CommandAdapter {
    async fn deploy(
        &self,
        target: &TargetId,
        source: Option<&str>,
        logs: &dyn LogSink,
    ) -> AdapterResult<()> {
        let placeholders = Placeholders {
            target: target.as_str(),
            source: source.unwrap_or_default(),
            tail: 0,
        };
        let commands = &self.config.commands;

        if let Some(create) = &commands.create {
            self.run("create", create, placeholders, logs).await?;
        }
        if let Some(configure) = &commands.configure {
            self.run("configure", configure, placeholders, logs).await?;
        }
        self.run("deploy", &commands.deploy, placeholders, logs).await
    }

    async fn restart(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()> {
        let placeholders = Placeholders {
            target: target.as_str(),
            source: "",
            tail: 0,
        };
        self.run("restart", &self.config.commands.restart, placeholders, logs)
            .await
    }

    async fn stop(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()> {
        let placeholders = Placeholders {
            target: target.as_str(),
            source: "",
            tail: 0,
        };
        self.run("stop", &self.config.commands.stop, placeholders, logs)
            .await
    }

    async fn delete(&self, target: &TargetId, logs: &dyn LogSink) -> AdapterResult<()> {
        let placeholders = Placeholders {
            target: target.as_str(),
            source: "",
            tail: 0,
        };
        self.run("delete", &self.config.commands.delete, placeholders, logs)
            .await
    }

    async fn fetch_logs(&self, target: &TargetId, tail: usize) -> AdapterResult<Vec<String>> {
        let placeholders = Placeholders {
            target: target.as_str(),
            source: "",
            tail,
        };
        let sink = CollectSink::default();
        self.run("logs", &self.config.commands.logs, placeholders, &sink)
            .await?;

        let lines = sink.0.into_inner();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::CommandTemplates;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_owned(), script.to_owned()]
    }

    fn adapter(commands: CommandTemplates) -> CommandAdapter {
        CommandAdapter::new(AdapterConfig {
            program: "sh".to_owned(),
            commands,
            timeout_secs: 5,
            ..AdapterConfig::default()
        })
        .expect("adapter")
    }

    #[test]
    fn render_drops_empty_arguments() {
        let placeholders = Placeholders {
            target: "app-1",
            source: "",
            tail: 20,
        };
        let template: Vec<String> = ["deploy", "--app", "{target}", "{source}", "-n={tail}"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        assert_eq!(
            placeholders.render(&template),
            vec!["deploy", "--app", "app-1", "-n=20"]
        );
    }

    #[test]
    fn rejects_empty_program() {
        let result = CommandAdapter::new(AdapterConfig {
            program: "  ".to_owned(),
            ..AdapterConfig::default()
        });
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn deploy_streams_output_from_every_step() {
        let adapter = adapter(CommandTemplates {
            create: Some(sh("echo creating {target}")),
            configure: Some(sh("echo configuring {target} >&2")),
            deploy: sh("echo deploying {source}"),
            ..CommandTemplates::default()
        });

        let sink = CollectSink::default();
        adapter
            .deploy(&TargetId::new("app-1"), Some("v2"), &sink)
            .await
            .expect("deploy");

        assert_eq!(
            sink.0.into_inner(),
            vec!["creating app-1", "configuring app-1", "deploying v2"]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_output_does_not_end_capture() {
        let adapter = adapter(CommandTemplates {
            restart: sh(concat!(
                "printf 'caf\\351 ok\\n'; ",
                "printf 'windows\\r\\n'; ",
                "i=1; while [ $i -le 2000 ]; do echo line $i; i=$((i+1)); done; ",
                "echo done"
            )),
            ..CommandTemplates::default()
        });

        let sink = CollectSink::default();
        let result = adapter.restart(&TargetId::new("app-1"), &sink).await;
        assert!(result.is_ok(), "restart failed: {result:?}");

        let lines = sink.0.into_inner();
        assert_eq!(lines.len(), 2003);
        assert_eq!(lines[0], "caf\u{fffd} ok");
        assert_eq!(lines[1], "windows");
        assert_eq!(lines[2002], "done");
    }

    #[test]
    fn decode_line_strips_terminators() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\xff\xfe\n"), "\u{fffd}\u{fffd}");
    }

    #[tokio::test]
    async fn exit_codes_are_classified() {
        let adapter = CommandAdapter::new(AdapterConfig {
            program: "sh".to_owned(),
            commands: CommandTemplates {
                restart: sh("exit 75"),
                stop: sh("exit 2"),
                ..CommandTemplates::default()
            },
            ..AdapterConfig::default()
        })
        .expect("adapter");
        let target = TargetId::new("app-1");

        let restart = adapter.restart(&target, &CollectSink::default()).await;
        assert!(matches!(restart, Err(AdapterError::Transient(_))));

        let stop = adapter.stop(&target, &CollectSink::default()).await;
        assert!(matches!(stop, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn missing_program_is_permanent() {
        let adapter = CommandAdapter::new(AdapterConfig {
            program: "/nonexistent/paas-cli".to_owned(),
            ..AdapterConfig::default()
        })
        .expect("adapter");

        let result = adapter
            .restart(&TargetId::new("app-1"), &CollectSink::default())
            .await;
        assert!(matches!(result, Err(AdapterError::Permanent(_))));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let adapter = CommandAdapter::new(AdapterConfig {
            program: "sh".to_owned(),
            commands: CommandTemplates {
                stop: sh("sleep 5"),
                ..CommandTemplates::default()
            },
            timeout_secs: 0,
            ..AdapterConfig::default()
        })
        .expect("adapter");

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            adapter.stop(&TargetId::new("app-1"), &CollectSink::default()),
        )
        .await
        .expect("adapter returns");
        assert!(matches!(result, Err(AdapterError::Transient(_))));
    }

    #[tokio::test]
    async fn fetch_logs_keeps_tail() {
        let adapter = adapter(CommandTemplates {
            logs: sh("for i in 1 2 3 4 5; do echo line $i; done"),
            ..CommandTemplates::default()
        });

        let lines = adapter
            .fetch_logs(&TargetId::new("app-1"), 2)
            .await
            .expect("logs");
        assert_eq!(lines, vec!["line 4", "line 5"]);
    }
}
