//! End-to-end tests against the real `proclaunch-launcher` binary

use bytes::Bytes;
use proclaunch::{
    ChannelMode, ExitStatus, LauncherConfig, LauncherInterface, ProcessErrorKind, ProcessEvent,
    ProcessMode, ProcessState, Token,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn launcher() -> (TempDir, LauncherInterface) {
    let dir = tempfile::tempdir().unwrap();
    let config = LauncherConfig::new(env!("CARGO_BIN_EXE_proclaunch-launcher"))
        .with_socket_dir(dir.path())
        .with_stop_timeout(Duration::from_secs(5));
    let launcher = LauncherInterface::new(config).unwrap();
    launcher.start().unwrap();
    (dir, launcher)
}

fn process_events_until(
    process: &mut proclaunch::CallerHandle,
    mut done: impl FnMut(&proclaunch::CallerHandle) -> bool,
) {
    let deadline = Instant::now() + WAIT;
    while !done(process) && Instant::now() < deadline {
        process.process_events();
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_echo_runs_to_completion() {
    let (_dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Reader).unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    process.on_event(move |event| sink.borrow_mut().push(event.clone()));

    process.start("echo", vec!["hi".into()], Bytes::new()).unwrap();
    assert!(process.wait_for_finished(WAIT));

    assert_eq!(process.exit_code(), 0);
    assert_eq!(process.exit_status(), ExitStatus::NormalExit);
    assert_eq!(process.read_all_standard_output(), b"hi\n");
    assert!(process.process_id() > 0);
    assert_eq!(process.state(), ProcessState::NotRunning);

    let events = events.borrow();
    assert!(matches!(events.first(), Some(ProcessEvent::Started { .. })));
    assert!(matches!(
        events.last(),
        Some(ProcessEvent::Finished { exit_code: 0, .. })
    ));
}

#[test]
fn test_cancel_running_process() {
    let (_dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Reader).unwrap();
    process.start("sleep", vec!["30".into()], Bytes::new()).unwrap();
    assert!(process.wait_for_started(WAIT));

    let begin = Instant::now();
    process.cancel();
    assert_eq!(process.state(), ProcessState::NotRunning);

    process_events_until(&mut process, |p| p.error() == ProcessErrorKind::Crashed);
    assert_eq!(process.error(), ProcessErrorKind::Crashed);
    assert_eq!(process.exit_status(), ExitStatus::CrashExit);
    assert!(begin.elapsed() < WAIT);
}

#[test]
fn test_missing_program_fails_to_start() {
    let (_dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Reader).unwrap();
    process
        .start("/nonexistent/definitely-not-here", vec![], Bytes::new())
        .unwrap();

    assert!(!process.wait_for_started(WAIT));
    assert_eq!(process.error(), ProcessErrorKind::FailedToStart);
    assert_eq!(process.exit_code(), 255);
    assert_eq!(process.state(), ProcessState::NotRunning);
}

#[test]
fn test_nonzero_exit_code_and_stderr() {
    let (_dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Reader).unwrap();
    process
        .start(
            "sh",
            vec!["-c".into(), "echo oops >&2; exit 3".into()],
            Bytes::new(),
        )
        .unwrap();

    assert!(process.wait_for_finished(WAIT));
    assert_eq!(process.exit_code(), 3);
    assert_eq!(process.read_all_standard_error(), b"oops\n");
    assert!(process.read_all_standard_output().is_empty());
}

#[test]
fn test_merged_channels() {
    let (_dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Reader).unwrap();
    process.set_process_channel_mode(ChannelMode::MergedChannels);
    process
        .start("sh", vec!["-c".into(), "echo err >&2".into()], Bytes::new())
        .unwrap();

    assert!(process.wait_for_finished(WAIT));
    assert_eq!(process.read_all_standard_output(), b"err\n");
    assert!(process.read_all_standard_error().is_empty());
}

#[test]
fn test_writer_mode_round_trip() {
    let (_dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Writer).unwrap();
    process
        .start("head", vec!["-n".into(), "1".into()], Bytes::new())
        .unwrap();
    assert!(process.wait_for_started(WAIT));

    process.write(b"ping\n").unwrap();
    assert!(process.wait_for_finished(WAIT));
    assert_eq!(process.read_all_standard_output(), b"ping\n");
}

#[test]
fn test_environment_and_working_directory() {
    let (dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Reader).unwrap();
    process.set_working_directory(dir.path());
    process.set_environment([("PATH", "/usr/bin:/bin"), ("GREETING", "hello")]);
    process
        .start(
            "sh",
            vec!["-c".into(), "printf '%s %s' \"$GREETING\" \"$PWD\"".into()],
            Bytes::new(),
        )
        .unwrap();

    assert!(process.wait_for_finished(WAIT));
    let output = String::from_utf8(process.read_all_standard_output()).unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    assert!(output.starts_with("hello "));
    assert!(
        output.ends_with(&*dir.path().to_string_lossy())
            || output.ends_with(&*canonical.to_string_lossy())
    );
}

#[test]
fn test_stop_removes_socket_file() {
    let (dir, launcher) = launcher();
    let mut process = launcher.register(Token::next(), ProcessMode::Reader).unwrap();
    process.start("true", vec![], Bytes::new()).unwrap();
    assert!(process.wait_for_finished(WAIT));
    drop(process);

    launcher.stop().unwrap();
    assert!(!launcher.is_started());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
