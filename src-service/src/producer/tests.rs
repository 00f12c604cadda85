//! Producer and client together over the in-process directory.

use super::*;
use crate::capture::{Pattern, TestPattern};
use framebus_common::client::{ClientConfig, ClientError, ClientSource, ClientState};
use framebus_common::directory::LocalDirectory;
use framebus_common::transport::MemoryIdentity;
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

const NAME: &str = "org.framebus.VideoSource.test";
const CAPS: &str = "video/x-raw,format=RGB,width=8,height=4,framerate=30/1";

fn format() -> VideoFormat {
    CAPS.parse().unwrap()
}

fn settings() -> ProducerSettings {
    ProducerSettings {
        name: NAME.to_string(),
        format: format(),
        watchdog_timeout: Duration::from_secs(2),
        queue_depth: 2,
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        bus_name: NAME.to_string(),
        activation_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(10),
        drain_grace: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

fn pattern(pattern: Pattern) -> Box<dyn FrameSource> {
    Box::new(TestPattern::new(format(), pattern))
}

fn faults(pre_attach: &str, capture_frame: &str) -> FaultPoints {
    FaultPoints {
        pre_attach: Arc::new(FaultPoint::from_script(PRE_ATTACH, pre_attach)),
        capture_frame: Arc::new(FaultPoint::from_script(CAPTURE_FRAME, capture_frame)),
    }
}

/// Run a producer registered directly (no activation record).
async fn start_producer(
    directory: &LocalDirectory,
    producer: Producer,
) -> (JoinHandle<Result<ProducerStats, ProducerError>>, CancellationToken, CrashHandle) {
    let shutdown = CancellationToken::new();
    let crash = CrashHandle::returning();
    let task = {
        let directory = directory.clone();
        let shutdown = shutdown.clone();
        let crash = crash.clone();
        tokio::spawn(async move { producer.run(&directory, shutdown, crash).await })
    };
    // Wait for the name so clients don't race registration
    for _ in 0..200 {
        if directory.owner(NAME).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    (task, shutdown, crash)
}

/// Fault setup of a healthy instance.
fn healthy() -> Option<(FaultPoints, Duration)> {
    Some((FaultPoints::disabled(), Duration::from_secs(2)))
}

/// Install an activation record. `plan` gets the instance number and
/// returns its faults and watchdog timeout, or `None` to exit before
/// registering.
fn install_activator(
    directory: &LocalDirectory,
    plan: impl Fn(usize) -> Option<(FaultPoints, Duration)> + Send + Sync + 'static,
) -> Arc<AtomicUsize> {
    let instances = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&instances);
    directory.add_activatable(
        NAME,
        Arc::new(move |dir: LocalDirectory| -> BoxFuture<'static, ()> {
            let setup = plan(counter.fetch_add(1, Ordering::SeqCst));
            Box::pin(async move {
                // Exiting before registering is a failed activation
                let Some((faults, watchdog_timeout)) = setup else {
                    return;
                };
                let producer = Producer::new(
                    ProducerSettings {
                        watchdog_timeout,
                        ..settings()
                    },
                    pattern(Pattern::Counter),
                    faults,
                );
                let _ = producer
                    .run(&dir, CancellationToken::new(), CrashHandle::returning())
                    .await;
            })
        }),
    );
    instances
}

/// Only the first instance misbehaves, as `first` describes.
fn first_instance(
    first: impl Fn() -> Option<(FaultPoints, Duration)> + Send + Sync + 'static,
) -> impl Fn(usize) -> Option<(FaultPoints, Duration)> + Send + Sync + 'static {
    move |instance| if instance == 0 { first() } else { healthy() }
}

/// Descriptors open in this process that point at one of `ids`.
fn open_descriptors_for(ids: &HashSet<MemoryIdentity>) -> usize {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| std::fs::metadata(entry.ok()?.path()).ok())
        .filter(|meta| {
            ids.contains(&MemoryIdentity {
                dev: meta.dev(),
                ino: meta.ino(),
            })
        })
        .count()
}

/// Log output collected by a test subscriber.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Read `count` frames, checking per-channel ordering.
async fn read_frames(client: &mut ClientSource<LocalDirectory>, count: usize) {
    let mut last: Option<(u64, u64)> = None;
    for _ in 0..count {
        let frame = client
            .next_frame()
            .await
            .expect("stream failed")
            .expect("stream ended early");
        assert_eq!(frame.len(), format().frame_size());
        let attachment = client.attachments();
        if let Some((last_attachment, last_sequence)) = last {
            if last_attachment == attachment {
                assert!(frame.sequence > last_sequence);
            }
        }
        last = Some((attachment, frame.sequence));
    }
}

#[tokio::test]
async fn test_fan_out_to_two_clients() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let (task, shutdown, _) = start_producer(&directory, producer).await;

    let mut first = ClientSource::new(directory.clone(), client_config()).unwrap();
    let mut second = ClientSource::new(directory.clone(), client_config()).unwrap();
    tokio::join!(read_frames(&mut first, 10), read_frames(&mut second, 10));
    assert_eq!(first.frames_delivered(), 10);
    assert_eq!(second.frames_delivered(), 10);
    assert_eq!(first.attachments(), 1);

    shutdown.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_no_memory_reuse_between_frames() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::White), FaultPoints::disabled());
    let (_task, shutdown, _) = start_producer(&directory, producer).await;

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    let mut previous = client.next_frame().await.unwrap().unwrap();
    for _ in 0..10 {
        let frame = client.next_frame().await.unwrap().unwrap();
        // The previous frame is still alive, so its memory cannot be recycled
        assert_ne!(
            frame.memory_identity().unwrap(),
            previous.memory_identity().unwrap()
        );
        previous = frame;
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_size_jitter_filtered() {
    let directory = LocalDirectory::new();
    let source = TestPattern::new(format(), Pattern::White).size_jitter(true);
    let producer = Producer::new(settings(), Box::new(source), FaultPoints::disabled());
    let (task, shutdown, _) = start_producer(&directory, producer).await;

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    let first = client.next_frame().await.unwrap().unwrap().data().to_vec();
    for _ in 0..20 {
        let frame = client.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.len(), format().frame_size());
        assert_eq!(frame.data(), &first[..]);
    }

    shutdown.cancel();
    let stats = task.await.unwrap().unwrap();
    assert!(stats.dropped > 0);
}

#[tokio::test]
async fn test_timestamps_follow_frame_rate() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Counter), FaultPoints::disabled());
    let (_task, shutdown, _) = start_producer(&directory, producer).await;

    let framerate = format().framerate;
    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    let mut previous: Option<(u64, u64)> = None;
    let mut deltas = 0;
    for _ in 0..12 {
        let frame = client.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.pts, framerate.frame_pts(frame.sequence));
        assert_eq!(frame.duration, framerate.frame_duration(frame.sequence));
        assert_eq!(frame.data()[0], frame.sequence as u8);
        if let Some((sequence, pts)) = previous {
            if frame.sequence == sequence + 1 {
                let delta = frame.pts - pts;
                // 1/30 s within 1 ns
                assert!((delta as i64 - 33_333_333).abs() <= 1, "delta {}", delta);
                deltas += 1;
            }
        }
        previous = Some((frame.sequence, frame.pts));
    }
    assert!(deltas >= 9);
    shutdown.cancel();
}

#[tokio::test]
async fn test_attach_rejected_on_format_mismatch() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let table = producer.attachments();
    let (_task, shutdown, _) = start_producer(&directory, producer).await;

    let config = ClientConfig {
        caps: "video/x-raw,format=GRAY8,width=8,height=4".to_string(),
        ..client_config()
    };
    let mut client = ClientSource::new(directory.clone(), config).unwrap();
    let err = client.next_frame().await.unwrap_err();
    assert!(matches!(err, ClientError::AttachRejected(_)));
    assert_eq!(client.state(), ClientState::Failed);
    assert!(table.is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn test_partial_caps_learn_format() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let (_task, shutdown, _) = start_producer(&directory, producer).await;

    let config = ClientConfig {
        caps: "video/x-raw,format=RGB".to_string(),
        ..client_config()
    };
    let mut client = ClientSource::new(directory.clone(), config).unwrap();
    assert!(client.next_frame().await.unwrap().is_some());
    assert_eq!(client.format(), Some(format()));
    shutdown.cancel();
}

#[tokio::test]
async fn test_source_eos_ends_stream_cleanly() {
    let directory = LocalDirectory::new();
    let source = TestPattern::new(format(), Pattern::Counter).num_frames(Some(15));
    let producer = Producer::new(settings(), Box::new(source), FaultPoints::disabled());
    let (task, _shutdown, _) = start_producer(&directory, producer).await;

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    let mut frames = 0;
    while let Some(_frame) = client.next_frame().await.unwrap() {
        frames += 1;
    }
    assert!(frames > 0 && frames <= 15);
    assert_eq!(client.state(), ClientState::Eos);

    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.frames, 15);
    assert!(directory.owner(NAME).is_none());
}

#[tokio::test]
async fn test_shutdown_sends_eos() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let (task, shutdown, _) = start_producer(&directory, producer).await;

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    read_frames(&mut client, 3).await;
    shutdown.cancel();
    assert!(task.await.unwrap().is_ok());

    // Nothing can restart the producer, so the stream just ends
    while client.next_frame().await.unwrap().is_some() {}
    assert_eq!(client.state(), ClientState::Eos);
}

#[tokio::test]
async fn test_client_departure_releases_attachment() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let table = producer.attachments();
    let (_task, shutdown, _) = start_producer(&directory, producer).await;

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    read_frames(&mut client, 2).await;
    assert_eq!(table.len(), 1);
    drop(client);

    // Released within a handful of frame periods
    let deadline = Instant::now() + Duration::from_secs(2);
    while !table.is_empty() {
        assert!(Instant::now() < deadline, "attachment not released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_name_already_owned() {
    let directory = LocalDirectory::new();
    let first = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let (_task, shutdown, _) = start_producer(&directory, first).await;

    let second = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let result = second
        .run(&directory, CancellationToken::new(), CrashHandle::returning())
        .await;
    assert!(matches!(
        result,
        Err(ProducerError::Directory(DirectoryError::AlreadyOwned(_)))
    ));
    shutdown.cancel();
}

#[tokio::test]
async fn test_frames_too_large_for_the_header_refused() {
    let directory = LocalDirectory::new();
    let huge = VideoFormat {
        format: framebus_common::PixelFormat::Rgba,
        width: 32768,
        height: 32768,
        framerate: framebus_common::Fraction::new(1, 1),
    };
    let producer = Producer::new(
        ProducerSettings {
            format: huge,
            ..settings()
        },
        pattern(Pattern::Counter),
        FaultPoints::disabled(),
    );
    let result = producer
        .run(&directory, CancellationToken::new(), CrashHandle::returning())
        .await;
    assert!(matches!(result, Err(ProducerError::Format(_))));
    assert!(directory.owner(NAME).is_none());
}

#[tokio::test]
async fn test_frame_descriptors_released_end_to_end() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Counter), FaultPoints::disabled());
    let (task, shutdown, _) = start_producer(&directory, producer).await;

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    let mut ids = HashSet::new();
    for _ in 0..25 {
        let frame = client.next_frame().await.unwrap().unwrap();
        ids.insert(frame.memory_identity().unwrap());
        drop(frame);
        // Only frames still queued for this client may be open
        assert!(open_descriptors_for(&ids) < 5);
    }
    assert_eq!(ids.len(), 25);

    shutdown.cancel();
    assert!(task.await.unwrap().is_ok());
    while client.next_frame().await.unwrap().is_some() {}
    assert_eq!(open_descriptors_for(&ids), 0);
}

#[tokio::test]
async fn test_watchdog_stall_is_logged() {
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let directory = LocalDirectory::new();
    let producer = Producer::new(
        ProducerSettings {
            watchdog_timeout: Duration::from_millis(300),
            ..settings()
        },
        pattern(Pattern::Bars),
        faults("", "skip skip usleep=10000000"),
    );
    let result = producer
        .run(&directory, CancellationToken::new(), CrashHandle::returning())
        .await;

    assert!(matches!(result, Err(ProducerError::Crashed)));
    assert!(logs.contents().contains("Watchdog triggered"));
    assert!(directory.owner(NAME).is_none());
}

#[tokio::test]
async fn test_recovery_through_every_failure_in_turn() {
    let directory = LocalDirectory::new();
    let instances = install_activator(&directory, |instance| match instance {
        0 => None,
        1 => Some((faults("abort", ""), Duration::from_secs(2))),
        2 => Some((
            faults("", "skip skip skip skip usleep=10000000"),
            Duration::from_millis(300),
        )),
        3 => Some((faults("", "skip skip gerror"), Duration::from_secs(2))),
        _ => healthy(),
    });

    let config = ClientConfig {
        max_attempts: 10,
        ..client_config()
    };
    let mut client = ClientSource::new(directory.clone(), config).unwrap();
    tokio::time::timeout(Duration::from_secs(30), async {
        while instances.load(Ordering::SeqCst) < 5 {
            read_frames(&mut client, 1).await;
        }
        read_frames(&mut client, 10).await;
    })
    .await
    .expect("client did not reach a healthy instance");

    assert_eq!(client.state(), ClientState::Streaming);
    assert!(client.attachments() >= 3);
}

#[tokio::test]
async fn test_recovery_from_exit_before_registering() {
    let directory = LocalDirectory::new();
    let instances = install_activator(&directory, first_instance(|| None));

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    read_frames(&mut client, 5).await;
    assert!(instances.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_recovery_from_death_mid_attach() {
    let directory = LocalDirectory::new();
    let instances = install_activator(&directory, first_instance(|| {
        Some((faults("abort", ""), Duration::from_secs(2)))
    }));

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    read_frames(&mut client, 5).await;
    assert!(instances.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_recovery_from_watchdog_stall() {
    let directory = LocalDirectory::new();
    let instances = install_activator(&directory, first_instance(|| {
        Some((
            faults("", "skip skip skip skip usleep=10000000"),
            Duration::from_millis(300),
        ))
    }));

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    read_frames(&mut client, 10).await;
    assert!(instances.load(Ordering::SeqCst) >= 2);
    assert!(client.attachments() >= 2);
}

#[tokio::test]
async fn test_recovery_from_stream_error() {
    let directory = LocalDirectory::new();
    let instances = install_activator(&directory, first_instance(|| {
        Some((faults("", "skip skip gerror"), Duration::from_secs(2)))
    }));

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    read_frames(&mut client, 10).await;
    assert!(instances.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_crash_without_activation_record_ends_stream() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(settings(), pattern(Pattern::Bars), FaultPoints::disabled());
    let (task, _shutdown, crash) = start_producer(&directory, producer).await;

    let mut client = ClientSource::new(directory.clone(), client_config()).unwrap();
    read_frames(&mut client, 3).await;

    crash.crash("test crash");
    assert!(matches!(task.await.unwrap(), Err(ProducerError::Crashed)));

    while client.next_frame().await.unwrap().is_some() {}
    assert_eq!(client.state(), ClientState::Eos);
}

#[tokio::test]
async fn test_stream_error_without_eos() {
    let directory = LocalDirectory::new();
    let producer = Producer::new(
        settings(),
        pattern(Pattern::Bars),
        faults("", "skip skip skip gerror"),
    );
    let (task, _shutdown, _) = start_producer(&directory, producer).await;

    let result = task.await.unwrap();
    match result {
        Err(ProducerError::Stream(msg)) => assert!(msg.contains("capture_frame")),
        other => panic!("expected stream error, got {:?}", other),
    }
    assert!(directory.owner(NAME).is_none());
}
