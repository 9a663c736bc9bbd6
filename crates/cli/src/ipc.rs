//! IPC between CLI and daemon using Unix sockets
//!
//! Every message is a bincode frame behind a 4-byte little-endian length.
//! A client opens one connection per request, tags it with its id and a
//! sequence number, and ignores any response carrying another sequence.

use anyhow::{Context, Result};
use lfsgc_cleaner::{DaemonStatus, RunArgs};
use nix::errno::Errno;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use ulid::Ulid;

/// Maximum IPC message size (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Responses read before a client gives up on a matching sequence
const MAX_STALE_RESPONSES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    GetStatus = 0,
    Run = 1,
    Suspend = 2,
    Resume = 3,
    Tune = 4,
    Reload = 5,
    Wait = 6,
    Stop = 7,
    Shutdown = 8,
}

impl TryFrom<u32> for Command {
    type Error = Errno;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Ok(match id {
            0 => Self::GetStatus,
            1 => Self::Run,
            2 => Self::Suspend,
            3 => Self::Resume,
            4 => Self::Tune,
            5 => Self::Reload,
            6 => Self::Wait,
            7 => Self::Stop,
            8 => Self::Shutdown,
            _ => return Err(Errno::EINVAL),
        })
    }
}

/// IPC request from CLI to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: u32,
    /// Length of `args`, checked by the daemon
    pub argsize: u32,
    pub client: Ulid,
    pub seq: u64,
    pub args: Vec<u8>,
}

impl Request {
    pub fn new<A: Serialize>(command: Command, client: Ulid, seq: u64, args: Option<&A>) -> Result<Self> {
        let args = match args {
            Some(args) => bincode::serialize(args).context("Failed to serialize request arguments")?,
            None => Vec::new(),
        };
        Ok(Self {
            command: command as u32,
            argsize: args.len() as u32,
            client,
            seq,
            args,
        })
    }

    /// Decode the argument payload
    pub fn args<A: DeserializeOwned>(&self) -> Result<A, Errno> {
        if self.argsize as usize != self.args.len() {
            return Err(Errno::EINVAL);
        }
        bincode::deserialize(&self.args).map_err(|_| Errno::EINVAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Nack,
}

/// IPC response from daemon to CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub reply: Reply,
    pub status: DaemonStatus,
    /// Zero on success
    pub errno: i32,
    /// Job started by `run`, or the current job; zero for none
    pub job_id: u32,
    pub seq: u64,
    pub cleaned_total: u64,
}

impl Response {
    pub fn ack(status: DaemonStatus, seq: u64) -> Self {
        Self {
            reply: Reply::Ack,
            status,
            errno: 0,
            job_id: 0,
            seq,
            cleaned_total: 0,
        }
    }

    pub fn nack(status: DaemonStatus, seq: u64, errno: Errno) -> Self {
        Self {
            reply: Reply::Nack,
            errno: errno as i32,
            ..Self::ack(status, seq)
        }
    }

    pub fn is_ack(&self) -> bool {
        self.reply == Reply::Ack
    }

    pub fn errno(&self) -> Errno {
        Errno::from_i32(self.errno)
    }
}

/// `RunArgs` on the wire: every field present, the mask says which count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgsWire {
    pub valid: u32,
    pub protection_period: u64,
    pub nsegments_per_clean: u32,
    pub cleaning_interval: u64,
    pub npasses: u32,
    pub min_reclaimable_blocks: u64,
}

impl RunArgsWire {
    pub const PROTECTION_PERIOD: u32 = 1 << 0;
    pub const NSEGMENTS_PER_CLEAN: u32 = 1 << 1;
    pub const CLEANING_INTERVAL: u32 = 1 << 2;
    pub const NPASSES: u32 = 1 << 3;
    pub const MIN_RECLAIMABLE_BLOCKS: u32 = 1 << 4;

    fn field<T: Copy>(&self, bit: u32, value: T) -> Option<T> {
        (self.valid & bit != 0).then_some(value)
    }
}

impl From<RunArgs> for RunArgsWire {
    fn from(args: RunArgs) -> Self {
        let mut wire = Self::default();
        if let Some(v) = args.protection_period {
            wire.valid |= Self::PROTECTION_PERIOD;
            wire.protection_period = v;
        }
        if let Some(v) = args.nsegments_per_clean {
            wire.valid |= Self::NSEGMENTS_PER_CLEAN;
            wire.nsegments_per_clean = v;
        }
        if let Some(v) = args.cleaning_interval {
            wire.valid |= Self::CLEANING_INTERVAL;
            wire.cleaning_interval = v;
        }
        if let Some(v) = args.npasses {
            wire.valid |= Self::NPASSES;
            wire.npasses = v;
        }
        if let Some(v) = args.min_reclaimable_blocks {
            wire.valid |= Self::MIN_RECLAIMABLE_BLOCKS;
            wire.min_reclaimable_blocks = v;
        }
        wire
    }
}

impl From<RunArgsWire> for RunArgs {
    fn from(wire: RunArgsWire) -> Self {
        Self {
            protection_period: wire.field(RunArgsWire::PROTECTION_PERIOD, wire.protection_period),
            nsegments_per_clean: wire.field(RunArgsWire::NSEGMENTS_PER_CLEAN, wire.nsegments_per_clean),
            cleaning_interval: wire.field(RunArgsWire::CLEANING_INTERVAL, wire.cleaning_interval),
            npasses: wire.field(RunArgsWire::NPASSES, wire.npasses),
            min_reclaimable_blocks: wire
                .field(RunArgsWire::MIN_RECLAIMABLE_BLOCKS, wire.min_reclaimable_blocks),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadArgs {
    /// Switch to this config file; the current one when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitArgs {
    pub job_id: u32,
    /// Seconds; wait indefinitely when unset
    pub timeout: Option<u64>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write one length-prefixed frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// An over-size length is rejected before the payload is read.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Socket a daemon serving `device` listens on
pub fn socket_path(runtime_dir: &Path, device: &str) -> PathBuf {
    runtime_dir.join(format!("{device}.sock"))
}

/// IPC client for CLI to communicate with daemon
pub struct IpcClient {
    socket_path: PathBuf,
    id: Ulid,
    seq: u64,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            id: Ulid::new(),
            seq: 0,
        }
    }

    /// Send a command and wait for its response
    pub async fn send<A: Serialize>(&mut self, command: Command, args: Option<&A>) -> Result<Response> {
        self.seq += 1;
        let request = Request::new(command, self.id, self.seq, args)?;

        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Failed to connect to daemon socket {}", self.socket_path.display()))?;
        write_frame(&mut stream, &request)
            .await
            .context("Failed to send request")?;

        for _ in 0..MAX_STALE_RESPONSES {
            let response: Response = read_frame(&mut stream)
                .await
                .context("Failed to read response")?;
            if response.seq == request.seq {
                return Ok(response);
            }
            tracing::debug!(expected = request.seq, got = response.seq, "dropping stale response");
        }
        anyhow::bail!("No response for request {}", request.seq)
    }

    pub async fn command(&mut self, command: Command) -> Result<Response> {
        self.send::<()>(command, None).await
    }

    pub async fn get_status(&mut self) -> Result<Response> {
        self.command(Command::GetStatus).await
    }

    pub async fn run(&mut self, args: RunArgs) -> Result<Response> {
        self.send(Command::Run, Some(&RunArgsWire::from(args))).await
    }

    pub async fn tune(&mut self, args: RunArgs) -> Result<Response> {
        self.send(Command::Tune, Some(&RunArgsWire::from(args))).await
    }

    pub async fn reload(&mut self, path: Option<PathBuf>) -> Result<Response> {
        self.send(Command::Reload, Some(&ReloadArgs { path })).await
    }

    pub async fn wait(&mut self, job_id: u32, timeout: Option<u64>) -> Result<Response> {
        self.send(Command::Wait, Some(&WaitArgs { job_id, timeout })).await
    }
}

/// What the daemon got from a connection
#[derive(Debug)]
pub enum Incoming {
    Request(Request),
    /// Could not be decoded; answered with EINVAL
    Malformed(String),
}

/// IPC server for daemon to handle CLI requests
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Start IPC server on Unix socket
    pub async fn start(socket_path: &Path) -> Result<Self> {
        // Remove stale socket if exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        let listener = UnixListener::bind(socket_path).context("Failed to bind Unix socket")?;

        // Owner-only
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(socket_path, permissions)
                .context("Failed to set socket permissions")?;
        }

        Ok(Self {
            listener,
            path: socket_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a single connection and return the stream
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept connection")?;
        Ok(stream)
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the request on a fresh connection
pub async fn read_request(stream: &mut UnixStream) -> Result<Incoming> {
    match read_frame::<_, Request>(stream).await {
        Ok(request) => Ok(Incoming::Request(request)),
        Err(FrameError::Io(err)) => Err(err).context("Failed to read request"),
        Err(err) => Ok(Incoming::Malformed(err.to_string())),
    }
}

pub async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    write_frame(stream, response)
        .await
        .context("Failed to write response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids() {
        assert_eq!(Command::try_from(0), Ok(Command::GetStatus));
        assert_eq!(Command::try_from(6), Ok(Command::Wait));
        assert_eq!(Command::try_from(8), Ok(Command::Shutdown));
        assert_eq!(Command::try_from(9), Err(Errno::EINVAL));
        assert_eq!(Command::Reload as u32, 5);
    }

    #[test]
    fn test_run_args_mask() {
        let args = RunArgs {
            nsegments_per_clean: Some(6),
            npasses: Some(0),
            ..Default::default()
        };
        let wire = RunArgsWire::from(args);
        assert_eq!(wire.valid, RunArgsWire::NSEGMENTS_PER_CLEAN | RunArgsWire::NPASSES);
        assert_eq!(RunArgs::from(wire), args);

        // Values without their bit are ignored
        let wire = RunArgsWire {
            protection_period: 99,
            ..Default::default()
        };
        assert_eq!(RunArgs::from(wire), RunArgs::default());
    }

    #[test]
    fn test_argsize_mismatch_rejected() {
        let mut request = Request::new(
            Command::Wait,
            Ulid::new(),
            1,
            Some(&WaitArgs {
                job_id: 3,
                timeout: None,
            }),
        )
        .unwrap();
        assert_eq!(request.args::<WaitArgs>().unwrap().job_id, 3);

        request.argsize += 1;
        assert_eq!(request.args::<WaitArgs>(), Err(Errno::EINVAL));
    }

    #[tokio::test]
    async fn test_frames_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let response = Response {
            job_id: 4,
            cleaned_total: 12,
            ..Response::nack(DaemonStatus::RunningManual, 7, Errno::ETIMEDOUT)
        };
        write_frame(&mut a, &response).await.unwrap();
        let got: Response = read_frame(&mut b).await.unwrap();
        assert_eq!(got, response);
        assert_eq!(got.errno(), Errno::ETIMEDOUT);
    }

    #[tokio::test]
    async fn test_oversize_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&((MAX_MESSAGE_SIZE as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        let err = read_frame::<_, Response>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }
}
