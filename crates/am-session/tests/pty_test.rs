use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use am_session::pty::{PtyProcess, SpawnRequest, TerminalProcess};
use am_session::scrollback::{OffscreenTerminal, SharedTerminal, Vt100Terminal};

fn spawn(command: &str, args: &[&str]) -> PtyProcess {
    PtyProcess::spawn(
        &SpawnRequest {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cols: 80,
            rows: 24,
        },
        Path::new("/tmp"),
        None,
    )
    .expect("spawn")
}

/// Collect output until `needle` shows up or the deadline passes.
fn read_until(rx: &flume::Receiver<Vec<u8>>, needle: &str, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(chunk) => {
                out.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&out).contains(needle) {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn echo_output_is_delivered() {
    let process = spawn("/bin/sh", &["-c", "sleep 0.2; echo hello world"]);
    let sub = process.subscribe();
    let text = read_until(&sub.receiver, "hello world", Duration::from_secs(5));
    assert!(text.contains("hello world"), "got: {text:?}");
}

#[test]
fn input_is_echoed_by_cat() {
    let process = spawn("/bin/cat", &[]);
    let sub = process.subscribe();
    process.write(b"ping\n").unwrap();
    let text = read_until(&sub.receiver, "ping", Duration::from_secs(5));
    assert!(text.contains("ping"), "got: {text:?}");
    assert!(process.is_alive());
    assert!(process.pid().is_some());
}

#[test]
fn exit_closes_stream_and_records_code() {
    let process = spawn("/bin/sh", &["-c", "sleep 0.2; exit 3"]);
    let sub = process.subscribe();
    // Drain until the hub closes.
    while sub.receiver.recv_timeout(Duration::from_secs(5)).is_ok() {}
    let deadline = Instant::now() + Duration::from_secs(5);
    while process.exit_code().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(process.exit_code(), Some(3));
    assert!(!process.is_alive());

    let late = process.subscribe();
    assert!(late.receiver.recv_timeout(Duration::from_secs(1)).is_err());
}

#[test]
fn paused_process_delivers_nothing_until_resumed() {
    let process = spawn("/bin/cat", &[]);
    let sub = process.subscribe();
    process.write(b"warmup\n").unwrap();
    read_until(&sub.receiver, "warmup", Duration::from_secs(5));

    process.pause();
    process.pause();
    assert!(process.is_paused());
    // The reader may already be blocked in read(); let that chunk through.
    process.write(b"first\n").unwrap();
    read_until(&sub.receiver, "first", Duration::from_secs(2));

    process.write(b"held\n").unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert!(sub.receiver.try_recv().is_err(), "output leaked while paused");

    process.resume();
    assert!(!process.is_paused());
    let text = read_until(&sub.receiver, "held", Duration::from_secs(5));
    assert!(text.contains("held"), "got: {text:?}");
}

#[test]
fn unsubscribed_listener_receives_nothing() {
    let process = spawn("/bin/cat", &[]);
    let keep = process.subscribe();
    let gone = process.subscribe();
    assert!(process.unsubscribe(gone.id));

    process.write(b"only-one\n").unwrap();
    read_until(&keep.receiver, "only-one", Duration::from_secs(5));
    assert!(gone.receiver.try_recv().is_err());
}

#[test]
fn kill_terminates_child() {
    let process = spawn("/bin/cat", &[]);
    let sub = process.subscribe();
    process.kill().unwrap();
    while sub.receiver.recv_timeout(Duration::from_secs(5)).is_ok() {}
    let deadline = Instant::now() + Duration::from_secs(5);
    while process.is_alive() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!process.is_alive());
    // Killing again is harmless.
    process.kill().unwrap();
}

#[test]
fn mirror_sees_output_and_resize() {
    let mirror: SharedTerminal = Arc::new(Mutex::new(
        Box::new(Vt100Terminal::new(80, 24)) as Box<dyn OffscreenTerminal>
    ));
    let process = PtyProcess::spawn(
        &SpawnRequest {
            command: "/bin/cat".into(),
            args: vec![],
            cols: 80,
            rows: 24,
        },
        Path::new("/tmp"),
        Some(mirror.clone()),
    )
    .unwrap();
    let sub = process.subscribe();
    process.write(b"mirrored\n").unwrap();
    read_until(&sub.receiver, "mirrored", Duration::from_secs(5));

    let lines = mirror.lock().unwrap().buffer_lines();
    assert!(lines.iter().any(|l| l.contains("mirrored")), "got: {lines:?}");

    process.resize(120, 40).unwrap();
    let dims = mirror.lock().unwrap().dimensions();
    assert_eq!((dims.cols, dims.rows), (120, 40));
}
