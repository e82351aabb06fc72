#![cfg(all(unix, not(target_os = "macos")))]

mod common;

use std::sync::Arc;
use std::time::Duration;

use cdp_adapter::{AdapterError, AdapterErrorKind, PageTarget};
use common::{eventually, fake_ffmpeg, FrameReply, ScriptedPage};
use framecast_capture::{capture, CaptureError, CaptureEvent, CaptureOptions, CaptureSession, StartOptions};
use parking_lot::Mutex;
use tempfile::TempDir;

async fn attached(dir: &TempDir, fps: f64) -> (CaptureSession, Arc<ScriptedPage>) {
    let page = ScriptedPage::new();
    let options = CaptureOptions::default()
        .with_fps(fps)
        .with_encoder_path(fake_ffmpeg(dir.path()));
    let session = capture(page.clone() as Arc<dyn PageTarget>, options)
        .await
        .expect("attach");
    (session, page)
}

fn encoder_failure() -> CaptureError {
    CaptureError::encoder("ffmpeg exited with code 3: boom")
}

#[tokio::test]
async fn records_every_captured_frame() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.on(move |event| {
        let entry = match event {
            CaptureEvent::FrameCaptured { index, timestamp, .. } => {
                format!("captured {index} @{timestamp}")
            }
            CaptureEvent::FrameRecorded { .. } => return,
            other => other.name().to_string(),
        };
        sink.lock().push(entry);
    });

    let output = dir.path().join("nested/out.mp4");
    session
        .start(output.clone(), StartOptions::default())
        .await
        .expect("start");
    assert!(session.is_capturing());
    assert!(session.captured_frames() >= 1);

    let before = session.capture_timestamp();
    session.wait_for_timeout(250.0).await.expect("wait");
    assert!(session.capture_timestamp() >= before + 250.0);

    session.stop().await.expect("stop");
    assert!(!session.is_capturing());
    assert_eq!(session.captured_frames(), session.recorded_frames());

    let written = std::fs::read(&output).expect("encoder output");
    assert_eq!(written.len() as u64, 3 * session.recorded_frames());

    let events = events.lock();
    assert_eq!(events.first().map(String::as_str), Some("captureStarted"));
    assert_eq!(events.last().map(String::as_str), Some("captureStopped"));
    assert_eq!(events[1], "captured 0 @0");
    assert_eq!(events[2], "captured 1 @50");
    assert!(page.count("HeadlessExperimental.beginFrame") as u64 >= session.captured_frames());
}

#[tokio::test]
async fn dropping_frames_can_be_toggled_mid_capture() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _page) = attached(&dir, 50.0).await;
    let recorded_events = Arc::new(Mutex::new(0u64));
    let counter = recorded_events.clone();
    session.on(move |event| {
        if let CaptureEvent::FrameRecorded { .. } = event {
            *counter.lock() += 1;
        }
    });

    session
        .start(
            dir.path().join("out.mp4"),
            StartOptions::default().drop_captured_frames(true),
        )
        .await
        .expect("start");
    assert!(session.drop_captured_frames());
    session.wait_for_timeout(100.0).await.unwrap();
    assert_eq!(session.recorded_frames(), 0);

    session.set_drop_captured_frames(false);
    session.wait_for_timeout(100.0).await.unwrap();
    session.stop().await.expect("stop");

    assert!(session.recorded_frames() > 0);
    assert!(session.recorded_frames() < session.captured_frames());
    assert_eq!(*recorded_events.lock(), session.recorded_frames());
}

#[tokio::test]
async fn frame_indexes_restart_with_each_capture() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _page) = attached(&dir, 20.0).await;

    session
        .start(dir.path().join("first.mp4"), StartOptions::default())
        .await
        .unwrap();
    session.wait_for_timeout(100.0).await.unwrap();
    session.stop().await.unwrap();
    assert!(session.capture_timestamp() >= 100.0);

    session
        .start(
            dir.path().join("second.mp4"),
            StartOptions::default().wait_for_first_frame(false),
        )
        .await
        .unwrap();
    assert!(session.captured_frames() <= 1);
    session.stop().await.unwrap();
    assert!(session.capture_timestamp() < 100.0);
}

#[tokio::test]
async fn detach_is_refused_while_capturing() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _page) = attached(&dir, 20.0).await;
    session
        .start(dir.path().join("out.mp4"), StartOptions::default())
        .await
        .unwrap();
    assert_eq!(
        session.detach().await.unwrap_err(),
        CaptureError::precondition("Can not detach while capture is in progress")
    );
    assert_eq!(
        session
            .start(dir.path().join("again.mp4"), StartOptions::default())
            .await
            .unwrap_err(),
        CaptureError::precondition("Capture is in progress")
    );
    session.stop().await.unwrap();
    session.detach().await.expect("detach after stop");
}

#[tokio::test]
async fn encoder_failure_surfaces_on_wait_and_next_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    page.set_frame_delay(Duration::from_millis(20));

    session
        .start(dir.path().join("fail.mp4"), StartOptions::default())
        .await
        .expect("first frame arrives before the encoder dies");

    assert_eq!(
        session.wait_for_timeout(60_000.0).await.unwrap_err(),
        encoder_failure()
    );
    assert!(eventually(|| !session.is_capturing()).await);

    assert_eq!(session.stop().await.unwrap_err(), encoder_failure());
    assert!(!session.is_capturing());
    assert_eq!(
        session.stop().await.unwrap_err(),
        CaptureError::precondition("Capture is not in progress")
    );
    assert!(session.page().is_some(), "encoder failures keep the page attached");
}

fn previous_failure() -> CaptureError {
    CaptureError::precondition("A previous capture failed; call stop() to retrieve the error")
}

#[tokio::test]
async fn pending_failure_blocks_start_until_stop_reports_it() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    page.set_frame_delay(Duration::from_millis(20));

    session
        .start(dir.path().join("fail.mp4"), StartOptions::default())
        .await
        .unwrap();
    assert!(eventually(|| !session.is_capturing()).await);

    assert_eq!(
        session
            .start(dir.path().join("ok.mp4"), StartOptions::default())
            .await
            .unwrap_err(),
        previous_failure()
    );
    assert_eq!(session.stop().await.unwrap_err(), encoder_failure());

    page.set_frame_delay(Duration::from_millis(1));
    session
        .start(dir.path().join("ok.mp4"), StartOptions::default())
        .await
        .expect("stop consumed the failure");
    session.stop().await.expect("clean stop");
}

#[tokio::test]
async fn closed_page_failure_outlives_reattach() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    session
        .start(dir.path().join("out.mp4"), StartOptions::default())
        .await
        .unwrap();
    page.close();
    assert!(eventually(|| session.page().is_none()).await);

    let replacement = ScriptedPage::new();
    session.attach(replacement.clone()).await.expect("reattach");
    assert_eq!(
        session
            .start(dir.path().join("again.mp4"), StartOptions::default())
            .await
            .unwrap_err(),
        previous_failure()
    );
    assert_eq!(session.stop().await.unwrap_err(), CaptureError::page_closed());

    session
        .start(dir.path().join("again.mp4"), StartOptions::default())
        .await
        .expect("start on the new page");
    session.stop().await.expect("clean stop");
}

#[tokio::test]
async fn page_closed_mid_capture_stops_and_detaches() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    session
        .start(dir.path().join("out.mp4"), StartOptions::default())
        .await
        .unwrap();
    session.wait_for_timeout(100.0).await.unwrap();

    page.set_frame_delay(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(5)).await;
    page.close();

    assert!(eventually(|| session.page().is_none()).await);
    assert!(!session.is_capturing());
    assert_eq!(session.stop().await.unwrap_err(), CaptureError::page_closed());
    assert_eq!(
        session.stop().await.unwrap_err(),
        CaptureError::precondition("Capture is not in progress")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn page_closed_between_steps_is_reported_as_closed() {
    for round in 0..30 {
        let dir = tempfile::tempdir().unwrap();
        let (session, page) = attached(&dir, 20.0).await;
        session
            .start(dir.path().join("out.mp4"), StartOptions::default())
            .await
            .unwrap();
        session.wait_for_timeout(100.0).await.unwrap();
        page.close();

        assert!(eventually(|| session.page().is_none()).await, "round {round}");
        assert_eq!(
            session.stop().await.unwrap_err(),
            CaptureError::page_closed(),
            "round {round}"
        );
    }
}

#[tokio::test]
async fn disconnect_while_idle_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    page.disconnect();

    assert!(eventually(|| session.page().is_none()).await);
    assert_eq!(
        session.stop().await.unwrap_err(),
        CaptureError::session_disconnected()
    );
    assert_eq!(
        session.stop().await.unwrap_err(),
        CaptureError::precondition("Capture is not in progress")
    );
}

#[tokio::test]
async fn frame_failure_rejects_first_frame_wait() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    page.push_frame(FrameReply::Fail(
        AdapterError::new(AdapterErrorKind::CdpIo).with_hint("renderer crashed"),
    ));

    let err = session
        .start(dir.path().join("out.mp4"), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(&err, CaptureError::Protocol(msg) if msg.contains("renderer crashed")));

    assert!(eventually(|| !session.is_capturing()).await);
    assert_eq!(session.stop().await.unwrap_err(), err);
    assert!(session.page().is_some());
}

#[tokio::test]
async fn no_damage_frames_do_not_advance_time() {
    let dir = tempfile::tempdir().unwrap();
    let (session, page) = attached(&dir, 20.0).await;
    page.push_frame(FrameReply::NoDamage);
    page.push_frame(FrameReply::NoDamage);

    session
        .start(dir.path().join("out.mp4"), StartOptions::default())
        .await
        .unwrap();
    session.stop().await.unwrap();

    assert!(page.count("HeadlessExperimental.beginFrame") >= 3);
    let ticks: Vec<String> = page
        .expressions()
        .into_iter()
        .filter(|expr| expr.contains(".tick("))
        .collect();
    assert!(ticks.len() >= 3);
    assert!(ticks[..3].iter().all(|expr| expr.ends_with(".tick(0)")));
}

#[tokio::test]
async fn attach_can_be_deferred() {
    let page = ScriptedPage::new();
    let mut options = CaptureOptions::default();
    options.attach_on_create = false;
    let session = capture(page.clone() as Arc<dyn PageTarget>, options)
        .await
        .unwrap();
    assert!(session.page().is_none());
    assert_eq!(page.count("Page.addScriptToEvaluateOnNewDocument"), 0);

    session.attach(page.clone()).await.unwrap();
    assert_eq!(session.page().map(|p| p.id()), Some(page.id()));
    assert_eq!(session.fps(), 60.0);
}
