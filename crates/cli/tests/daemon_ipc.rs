//! Daemon and clients talking over a real Unix socket

mod common;

use cli_lib::cmd::clean::reclaim_segments;
use cli_lib::ipc::{read_frame, Command, Request, Response};
use common::TestFs;
use lfsgc_cleaner::{CleanerConfig, DaemonStatus, RunArgs};
use nix::errno::Errno;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use ulid::Ulid;

fn quick_job() -> RunArgs {
    RunArgs {
        nsegments_per_clean: Some(2),
        cleaning_interval: Some(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_manual_job_runs_to_completion() {
    let mut fx = TestFs::new();
    for segnum in 10..14 {
        fx.write_dead(segnum);
    }
    let daemon = fx.daemon(CleanerConfig::default()).await;

    let clients = async {
        let mut client = fx.client();

        let status = client.get_status().await.unwrap();
        assert!(status.is_ack());
        assert_eq!(status.status, DaemonStatus::Idle);
        assert_eq!(status.job_id, 0);

        let run = client.run(quick_job()).await.unwrap();
        assert!(run.is_ack());
        assert_eq!(run.job_id, 1);

        let done = client.wait(1, Some(30)).await.unwrap();
        assert!(done.is_ack(), "wait failed: {}", done.errno());
        assert_eq!(done.job_id, 1);

        let status = client.get_status().await.unwrap();
        assert_eq!(status.status, DaemonStatus::Idle);
        assert_eq!(status.cleaned_total, 4);

        // The job is over, waiting again returns at once
        assert!(client.wait(1, Some(30)).await.unwrap().is_ack());

        assert!(client.command(Command::Shutdown).await.unwrap().is_ack());
    };

    let (result, ()) = tokio::join!(daemon.run(), clients);
    result.unwrap();
    assert_eq!(fx.fs.reclaimable_count(), 0);
    assert!(!fx.socket_path().exists());
}

#[tokio::test]
async fn test_suspended_job_wait_times_out_then_stop() {
    let mut fx = TestFs::new();
    for segnum in 10..14 {
        fx.write_dead(segnum);
    }
    let daemon = fx.daemon(CleanerConfig::default()).await;

    let clients = async {
        let mut client = fx.client();

        // The first step cleans two segments, then the job is held
        let run = client.run(quick_job()).await.unwrap();
        let suspended = client.command(Command::Suspend).await.unwrap();
        assert_eq!(suspended.status, DaemonStatus::Suspended);
        assert_eq!(suspended.job_id, run.job_id);

        let waited = client.wait(run.job_id, Some(1)).await.unwrap();
        assert!(!waited.is_ack());
        assert_eq!(waited.errno(), Errno::ETIMEDOUT);

        let stopped = client.command(Command::Stop).await.unwrap();
        assert!(stopped.is_ack());
        assert_eq!(stopped.job_id, run.job_id);
        assert_eq!(stopped.status, DaemonStatus::Suspended);

        let resumed = client.command(Command::Resume).await.unwrap();
        assert_eq!(resumed.status, DaemonStatus::Idle);

        assert!(client.command(Command::Shutdown).await.unwrap().is_ack());
    };

    let (result, ()) = tokio::join!(daemon.run(), clients);
    result.unwrap();
}

#[tokio::test]
async fn test_bad_requests_are_refused() {
    let fx = TestFs::new();
    let daemon = fx.daemon(CleanerConfig::default()).await;

    let clients = async {
        // Not a request at all
        let mut stream = UnixStream::connect(fx.socket_path()).await.unwrap();
        stream.write_all(&3u32.to_le_bytes()).await.unwrap();
        stream.write_all(&[1, 2, 3]).await.unwrap();
        let response: Response = read_frame(&mut stream).await.unwrap();
        assert!(!response.is_ack());
        assert_eq!(response.errno(), Errno::EINVAL);

        // Unknown command id
        let mut stream = UnixStream::connect(fx.socket_path()).await.unwrap();
        let request = Request {
            command: 42,
            argsize: 0,
            client: Ulid::new(),
            seq: 9,
            args: Vec::new(),
        };
        cli_lib::ipc::write_frame(&mut stream, &request).await.unwrap();
        let response: Response = read_frame(&mut stream).await.unwrap();
        assert_eq!(response.seq, 9);
        assert_eq!(response.errno(), Errno::EINVAL);

        let mut client = fx.client();

        // Run without its arguments
        let response = client.command(Command::Run).await.unwrap();
        assert_eq!(response.errno(), Errno::EINVAL);
        assert_eq!(response.status, DaemonStatus::Idle);

        // No job was ever started
        let response = client.wait(1, Some(1)).await.unwrap();
        assert_eq!(response.errno(), Errno::ENOENT);

        assert!(client.command(Command::Shutdown).await.unwrap().is_ack());
    };

    let (result, ()) = tokio::join!(daemon.run(), clients);
    result.unwrap();
}

#[tokio::test]
async fn test_reload_keeps_old_config_on_error() {
    let fx = TestFs::new();
    std::fs::write(fx.config_path(), "protection_period = 60\n").unwrap();
    let broken = fx.dir.path().join("broken.toml");
    std::fs::write(&broken, "nsegments_per_clean = 0\n").unwrap();
    let daemon = fx.daemon(CleanerConfig::default()).await;

    let clients = async {
        let mut client = fx.client();

        assert!(client.reload(None).await.unwrap().is_ack());

        let response = client.reload(Some(broken.clone())).await.unwrap();
        assert_eq!(response.errno(), Errno::EINVAL);

        let response = client
            .reload(Some(fx.dir.path().join("missing.toml")))
            .await
            .unwrap();
        assert!(!response.is_ack());

        assert!(client.command(Command::Shutdown).await.unwrap().is_ack());
    };

    let (result, ()) = tokio::join!(daemon.run(), clients);
    result.unwrap();
}

#[test]
fn test_one_shot_clean_and_assess() {
    let mut fx = TestFs::new();
    for segnum in 20..23 {
        fx.write_dead(segnum);
    }
    let config = CleanerConfig::default();

    let assessed = reclaim_segments(
        fx.fs.clone(),
        fx.clock.clone(),
        &config,
        &[20, 21, 22],
        config.protection_period,
        true,
    )
    .unwrap();
    assert_eq!(assessed.cleaned_segs, 0);
    assert_eq!(assessed.defunct_vblocks, 18);
    assert!(fx.fs.cleaned().is_empty());

    let cleaned = reclaim_segments(
        fx.fs.clone(),
        fx.clock.clone(),
        &config,
        &[20, 21, 22],
        config.protection_period,
        false,
    )
    .unwrap();
    assert_eq!(cleaned.cleaned_segs, 3);
    assert_eq!(cleaned.live_total(), 0);
    assert_eq!(fx.fs.reclaimable_count(), 0);
}
