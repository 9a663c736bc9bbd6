//! Daemon lifecycle management
//!
//! The daemon alternates between running one scheduler cycle and waiting
//! for the sleep that cycle asked for. While it waits it answers clients,
//! reloads on SIGHUP and stops on SIGTERM, SIGINT or a shutdown request.
//! Commands that change what the cleaner does cut the wait short.

use crate::ipc::{
    read_request, write_response, Command, Incoming, IpcServer, ReloadArgs, Request, Response,
    RunArgsWire, WaitArgs,
};
use crate::locks::DaemonLock;
use crate::{system_config, util};
use anyhow::{Context, Result};
use lfsgc_cleaner::{CleanerConfig, CleanerError, Scheduler};
use lfsgc_journal::{SystemClock, TrackBackError};
use nix::errno::Errno;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;

/// A client slower than this to send its request is dropped
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// What the loop does after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Run a cycle now instead of finishing the sleep
    Reschedule,
    Shutdown,
}

/// A client blocked in `wait` until a job ends
struct Waiter {
    job_id: u32,
    seq: u64,
    deadline: Option<Instant>,
    stream: UnixStream,
}

pub struct Daemon {
    scheduler: Scheduler,
    ipc_server: IpcServer,
    config_path: PathBuf,
    waiters: Vec<Waiter>,
    /// Highest job id handed out
    last_job: u32,
    span: tracing::Span,
}

impl Daemon {
    pub fn new(
        scheduler: Scheduler,
        ipc_server: IpcServer,
        config_path: PathBuf,
        span: tracing::Span,
    ) -> Self {
        Self {
            scheduler,
            ipc_server,
            config_path,
            waiters: Vec::new(),
            last_job: 0,
            span,
        }
    }

    /// Run main daemon event loop
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(parent: &self.span, pid = std::process::id(), "cleaner started");

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        'cycle: loop {
            let wake = Instant::now() + self.cycle().await?;

            loop {
                let expiry = self.next_expiry();

                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => continue 'cycle,

                    accepted = self.ipc_server.accept() => match accepted {
                        Ok(stream) => match self.handle_connection(stream).await {
                            Flow::Continue => {}
                            Flow::Reschedule => continue 'cycle,
                            Flow::Shutdown => {
                                tracing::info!(parent: &self.span, "shutdown requested");
                                break 'cycle;
                            }
                        },
                        Err(err) => tracing::warn!(parent: &self.span, error = %err, "IPC accept failed"),
                    },

                    _ = tokio::time::sleep_until(expiry.unwrap_or(wake)), if expiry.is_some() => {
                        self.expire_waiters().await;
                    }

                    _ = sighup.recv() => {
                        if let Err(err) = self.reload(None) {
                            tracing::warn!(parent: &self.span, error = %format!("{err:#}"), "reload failed, keeping old config");
                        }
                        continue 'cycle;
                    }
                    _ = sigterm.recv() => {
                        tracing::info!(parent: &self.span, "received SIGTERM, shutting down");
                        break 'cycle;
                    }
                    _ = sigint.recv() => {
                        tracing::info!(parent: &self.span, "received SIGINT, shutting down");
                        break 'cycle;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One scheduler step; returns how long to wait before the next
    async fn cycle(&mut self) -> Result<Duration> {
        match self.scheduler.run_cycle() {
            Ok(outcome) => {
                if let Some(job) = outcome.finished_job {
                    self.finish_waiters(job).await;
                }
                Ok(outcome.sleep)
            }
            Err(err @ CleanerError::TrackBack(TrackBackError::EmptyCache)) => {
                Err(err).context("Checkpoint history lost track of time")
            }
            Err(err) => {
                tracing::error!(parent: &self.span, error = %err, "cleaning cycle failed");
                Ok(self.scheduler.config().retry_interval())
            }
        }
    }

    async fn handle_connection(&mut self, mut stream: UnixStream) -> Flow {
        let incoming = match tokio::time::timeout(REQUEST_TIMEOUT, read_request(&mut stream)).await {
            Ok(Ok(incoming)) => incoming,
            Ok(Err(err)) => {
                tracing::warn!(parent: &self.span, error = %format!("{err:#}"), "dropping client");
                return Flow::Continue;
            }
            Err(_) => {
                tracing::warn!(parent: &self.span, "client sent no request in time");
                return Flow::Continue;
            }
        };

        let request = match incoming {
            Incoming::Request(request) => request,
            Incoming::Malformed(reason) => {
                tracing::warn!(parent: &self.span, %reason, "malformed request");
                self.respond(&mut stream, self.response(0, Err(Errno::EINVAL))).await;
                return Flow::Continue;
            }
        };

        let command = match Command::try_from(request.command) {
            Ok(command) => command,
            Err(errno) => {
                tracing::warn!(parent: &self.span, command = request.command, "unknown command");
                self.respond(&mut stream, self.response(request.seq, Err(errno))).await;
                return Flow::Continue;
            }
        };
        tracing::debug!(parent: &self.span, client = %request.client, seq = request.seq, ?command, "request");

        if command == Command::Wait {
            self.start_wait(&request, stream).await;
            return Flow::Continue;
        }

        let result = self.execute(command, &request);
        if let Err(errno) = result {
            tracing::warn!(parent: &self.span, ?command, %errno, "request refused");
        }
        let flow = match (command, result) {
            (_, Err(_)) | (Command::GetStatus, _) => Flow::Continue,
            (Command::Shutdown, _) => Flow::Shutdown,
            _ => Flow::Reschedule,
        };
        self.respond(&mut stream, self.response(request.seq, result)).await;
        self.cancel_orphaned_waiters().await;
        flow
    }

    /// Apply a command; returns the job id to report
    fn execute(&mut self, command: Command, request: &Request) -> Result<Option<u32>, Errno> {
        match command {
            Command::GetStatus | Command::Shutdown => Ok(None),
            Command::Run => {
                let args: RunArgsWire = request.args()?;
                let id = self.scheduler.run(args.into());
                self.last_job = self.last_job.max(id);
                Ok(Some(id))
            }
            Command::Suspend => {
                self.scheduler.suspend();
                Ok(None)
            }
            Command::Resume => {
                self.scheduler.resume();
                Ok(None)
            }
            Command::Tune => {
                let args: RunArgsWire = request.args()?;
                self.scheduler.tune(args.into());
                Ok(None)
            }
            Command::Reload => {
                let args: ReloadArgs = request.args()?;
                self.reload(args.path).map_err(|err| {
                    tracing::warn!(parent: &self.span, error = %format!("{err:#}"), "reload failed, keeping old config");
                    Errno::EINVAL
                })?;
                Ok(None)
            }
            Command::Stop => Ok(self.scheduler.stop()),
            Command::Wait => Err(Errno::EINVAL),
        }
    }

    fn response(&self, seq: u64, result: Result<Option<u32>, Errno>) -> Response {
        let report = self.scheduler.status();
        let mut response = match result {
            Ok(job) => Response {
                job_id: job.or(report.job_id).unwrap_or(0),
                ..Response::ack(report.status, seq)
            },
            Err(errno) => Response::nack(report.status, seq, errno),
        };
        response.cleaned_total = report.cleaned_total;
        response
    }

    async fn respond(&self, stream: &mut UnixStream, response: Response) {
        if let Err(err) = write_response(stream, &response).await {
            tracing::debug!(parent: &self.span, error = %format!("{err:#}"), seq = response.seq, "client went away");
        }
    }

    /// Re-read the config file, or switch to `path`
    fn reload(&mut self, path: Option<PathBuf>) -> Result<()> {
        let path = path.unwrap_or_else(|| self.config_path.clone());
        let config = system_config::load(&path)?;
        self.scheduler.reload(config)?;
        tracing::info!(parent: &self.span, path = %path.display(), "config reloaded");
        self.config_path = path;
        Ok(())
    }

    async fn start_wait(&mut self, request: &Request, mut stream: UnixStream) {
        let args: WaitArgs = match request.args() {
            Ok(args) => args,
            Err(errno) => {
                self.respond(&mut stream, self.response(request.seq, Err(errno))).await;
                return;
            }
        };

        if args.job_id == 0 || args.job_id > self.last_job {
            self.respond(&mut stream, self.response(request.seq, Err(Errno::ENOENT))).await;
            return;
        }
        if self.scheduler.status().job_id != Some(args.job_id) {
            // Already over
            self.respond(&mut stream, self.response(request.seq, Ok(Some(args.job_id)))).await;
            return;
        }

        self.waiters.push(Waiter {
            job_id: args.job_id,
            seq: request.seq,
            deadline: args.timeout.map(|secs| Instant::now() + Duration::from_secs(secs)),
            stream,
        });
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.waiters.iter().filter_map(|w| w.deadline).min()
    }

    /// Answer and drop the waiters `pred` picks
    async fn release_waiters(
        &mut self,
        pred: impl Fn(&Waiter) -> bool,
        result: impl Fn(&Waiter) -> Result<Option<u32>, Errno>,
    ) {
        let (done, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.waiters).into_iter().partition(|w| pred(w));
        self.waiters = pending;
        for mut waiter in done {
            let response = self.response(waiter.seq, result(&waiter));
            self.respond(&mut waiter.stream, response).await;
        }
    }

    async fn finish_waiters(&mut self, job: u32) {
        self.release_waiters(|w| w.job_id == job, |w| Ok(Some(w.job_id))).await;
    }

    async fn expire_waiters(&mut self) {
        let now = Instant::now();
        self.release_waiters(
            |w| w.deadline.is_some_and(|deadline| deadline <= now),
            |_| Err(Errno::ETIMEDOUT),
        )
        .await;
    }

    /// Waiters whose job was stopped or replaced
    async fn cancel_orphaned_waiters(&mut self) {
        let current = self.scheduler.status().job_id;
        self.release_waiters(|w| Some(w.job_id) != current, |_| Err(Errno::ECANCELED))
            .await;
    }

    async fn shutdown(mut self) {
        self.release_waiters(|_| true, |_| Err(Errno::ECANCELED)).await;
        tracing::info!(parent: &self.span, cleaned = self.scheduler.status().cleaned_total, "shutdown complete");
    }
}

/// Where to find the filesystem a daemon cleans
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub device: PathBuf,
    pub mount_dir: PathBuf,
    pub config_path: PathBuf,
}

/// Run a cleaner for one device until told to stop
pub async fn start(options: DaemonOptions, config: CleanerConfig) -> Result<()> {
    let name = util::device_name(&options.device)?;
    let runtime_dir = config.runtime_dir.clone();

    let lock = DaemonLock::acquire(&runtime_dir, &name).context("Failed to acquire daemon lock")?;

    let control = util::open_device(&options.device, &options.mount_dir, &config)?;
    let span = tracing::info_span!("cleaner", device = %name);
    let scheduler = Scheduler::new(control, Arc::new(SystemClock), config, span.clone())
        .context("Failed to start scheduler")?;

    let ipc_server = IpcServer::start(&crate::ipc::socket_path(&runtime_dir, &name))
        .await
        .context("Failed to start IPC server")?;

    Daemon::new(scheduler, ipc_server, options.config_path, span)
        .run()
        .await?;

    lock.release()
}
