use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conductor_protocol::backend::{SpawnBackend, SpawnedProcess};
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::session::SpawnRequest;
use portable_pty::{Child, CommandBuilder, MasterPty, native_pty_system};
use tokio::sync::mpsc;
use tokio::task;

use crate::coalescer::{RawSignal, run_output_coalescer};
use crate::policy::PtyOutputPolicy;
use crate::process::{PtyProcess, PtyProcessOutput, process_error, to_pty_size};

const READ_CHUNK_SIZE: usize = 8 * 1024;

struct SpawnedPty {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

/// Runs each session in its own pseudo-terminal.
#[derive(Debug, Clone, Default)]
pub struct PtyBackend {
    policy: PtyOutputPolicy,
}

impl PtyBackend {
    pub fn new(policy: PtyOutputPolicy) -> Self {
        Self {
            policy: policy.normalized(),
        }
    }
}

#[async_trait]
impl SpawnBackend for PtyBackend {
    async fn spawn(&self, request: SpawnRequest) -> ConductorResult<SpawnedProcess> {
        if request.command.program.trim().is_empty() {
            return Err(ConductorError::Spawn(
                "session program must not be empty".to_owned(),
            ));
        }
        if request.size.cols == 0 || request.size.rows == 0 {
            return Err(ConductorError::Configuration(
                "PTY size must have non-zero rows and columns".to_owned(),
            ));
        }
        if let Some(workdir) = request.command.workdir.as_ref() {
            if !workdir.is_dir() {
                return Err(ConductorError::Spawn(format!(
                    "working directory {} does not exist",
                    workdir.display()
                )));
            }
        }

        let session_id = request.session_id.clone();
        let spawned = task::spawn_blocking(move || spawn_pty_process(request))
            .await
            .map_err(|error| ConductorError::Internal(format!("PTY spawn task failed: {error}")))??;

        let process_id = spawned.child.process_id();
        let killer = spawned.child.clone_killer();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let policy = self.policy;
        std::thread::spawn(move || run_output_coalescer(raw_rx, output_tx, policy));
        spawn_read_loop(spawned.reader, raw_tx.clone());
        spawn_write_loop(spawned.writer, stdin_rx);
        spawn_child_wait_loop(spawned.child, raw_tx);

        tracing::debug!(session_id = %session_id, process_id, "PTY session process started");
        Ok(SpawnedProcess {
            handle: Arc::new(PtyProcess {
                master: Mutex::new(spawned.master),
                killer: Mutex::new(killer),
                stdin_tx,
                process_id,
            }),
            output: Box::new(PtyProcessOutput {
                receiver: output_rx,
            }),
        })
    }
}

fn spawn_pty_process(request: SpawnRequest) -> ConductorResult<SpawnedPty> {
    let environment = request.merged_environment();
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(to_pty_size(request.size))
        .map_err(process_error)?;

    let mut command = CommandBuilder::new(&request.command.program);
    if let Some(workdir) = request.command.workdir {
        command.cwd(workdir);
    }
    for arg in request.command.args {
        command.arg(arg);
    }
    for (key, value) in environment {
        command.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|error| ConductorError::Spawn(error.to_string()))?;
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(error) => {
            terminate_child(child);
            return Err(process_error(error));
        }
    };

    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(error) => {
            terminate_child(child);
            return Err(process_error(error));
        }
    };

    Ok(SpawnedPty {
        master: pair.master,
        reader,
        writer,
        child,
    })
}

fn terminate_child(mut child: Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_read_loop(mut reader: Box<dyn Read + Send>, raw_tx: Sender<RawSignal>) {
    std::thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    if raw_tx.send(RawSignal::Bytes(buffer[..read].to_vec())).is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn spawn_write_loop(
    mut writer: Box<dyn Write + Send>,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Some(input) = stdin_rx.blocking_recv() {
            if input.is_empty() {
                continue;
            }
            if writer.write_all(&input).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });
}

fn spawn_child_wait_loop(mut child: Box<dyn Child + Send + Sync>, raw_tx: Sender<RawSignal>) {
    std::thread::spawn(move || {
        let exit_code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).ok(),
            Err(error) => {
                tracing::debug!(error = %error, "PTY child wait failed");
                None
            }
        };
        let _ = raw_tx.send(RawSignal::Exited(exit_code));
    });
}
