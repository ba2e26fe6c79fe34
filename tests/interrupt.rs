//! Ctrl-C on the `ncs` binary: both sides stop through their stop signal, run their shutdown
//! path, flush the event log and exit successfully.
#![cfg(unix)]

use std::{
    io::{BufRead, BufReader},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver},
    thread,
    time::{Duration, Instant},
};

fn spawn_ncs(args: &[&str]) -> (Child, Receiver<String>) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_ncs"))
        .args(args)
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let stderr = child.stderr.take().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    (child, rx)
}

/// Collects log lines until one contains `marker`.
fn wait_for(lines: &Receiver<String>, marker: &str, seen: &mut Vec<String>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(line) = lines.recv_timeout(Duration::from_millis(100)) {
            let found = line.contains(marker);
            seen.push(line);
            if found {
                return;
            }
        }
    }
    panic!("'{}' never logged; got {:#?}", marker, seen);
}

fn interrupt_and_wait(child: &mut Child) -> ExitStatus {
    let sent = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(sent.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            child.kill().ok();
            panic!("ncs did not exit after SIGINT");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn write_config(path: &Path, yaml: &str) {
    std::fs::write(path, yaml).unwrap();
}

#[test]
fn controller_stops_cleanly_on_interrupt() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("controller.yaml");
    write_config(
        &config,
        &format!(
            "bind_addr: \"127.0.0.1:0\"\npoll_interval_ms: 20\noutput_dir: \"{}\"\n",
            dir.path().display()
        ),
    );

    let (mut child, lines) = spawn_ncs(&["controller", "--config", config.to_str().unwrap()]);
    let mut seen = Vec::new();
    wait_for(&lines, "listening on", &mut seen);

    let status = interrupt_and_wait(&mut child);
    seen.extend(lines.iter());
    assert!(status.success(), "status={:?} log={:#?}", status, seen);
    assert!(seen.iter().any(|l| l.contains("interrupt received")));
    assert!(seen.iter().any(|l| l.contains("[Controller] stopped")));
    assert!(dir.path().join("controller_events.csv").exists());
}

#[test]
fn plant_without_duration_stops_cleanly_on_interrupt() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("plant.yaml");
    write_config(
        &config,
        &format!(
            "tick_rate_hz: 100\nbind_addr: \"127.0.0.1:0\"\ncontroller_addr: \"127.0.0.1:9\"\npoll_interval_ms: 20\noutput_dir: \"{}\"\n",
            dir.path().display()
        ),
    );

    let (mut child, lines) = spawn_ncs(&["plant", "--config", config.to_str().unwrap()]);
    let mut seen = Vec::new();
    wait_for(&lines, "[Plant] starting", &mut seen);
    thread::sleep(Duration::from_millis(200));

    let status = interrupt_and_wait(&mut child);
    seen.extend(lines.iter());
    assert!(status.success(), "status={:?} log={:#?}", status, seen);
    assert!(seen.iter().any(|l| l.contains("[Plant] finished")));

    // Ticks ran for ~200 ms; the log was flushed on the way out.
    let events = std::fs::read_to_string(dir.path().join("plant_events.csv")).unwrap();
    assert!(events.lines().any(|l| l.contains("tick")), "{}", events);
}
