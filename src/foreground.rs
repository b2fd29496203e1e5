//! Foreground "run and watch" mode for a native service.
//!
//! The child's output is mirrored to the terminal and appended to its log file. Ctrl-T
//! or `q` (and Ctrl-C) request a graceful stop; the CLI exits only after the child has.
use std::{
    fs::OpenOptions,
    io::{self, BufRead, BufReader, Read, Write},
    process::{ExitStatus, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
    tty::IsTty,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{KILL_CONFIRM_TIMEOUT, PROCESS_CHECK_INTERVAL},
    daemon::{PidFile, ServiceDescriptor, build_command},
    error::StackError,
    probe::ProcessProbe,
};

/// How a foreground run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForegroundExit {
    /// Exit code, `None` if the child died from a signal.
    pub code: Option<i32>,
    /// True when the operator asked for the stop.
    pub cancelled: bool,
}

/// True for the keys that end a foreground run.
pub fn is_cancel_key(key: &KeyEvent) -> bool {
    if key.kind == KeyEventKind::Release {
        return false;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Char('Q') => key.modifiers.is_empty()
            || key.modifiers == KeyModifiers::SHIFT,
        KeyCode::Char('t') | KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// Raises `cancel` on Ctrl-C. Only one handler can exist per process.
pub fn install_interrupt_handler(cancel: Arc<AtomicBool>) {
    if let Err(err) = ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    }) {
        warn!("Could not install Ctrl-C handler: {err}");
    }
}

/// Reads keys on a background thread while stdin is a terminal.
struct KeyListener {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeyListener {
    fn spawn(cancel: Arc<AtomicBool>) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        if !io::stdin().is_tty() {
            return Self { done, handle: None };
        }
        if let Err(err) = terminal::enable_raw_mode() {
            warn!("Keyboard cancellation unavailable: {err}");
            return Self { done, handle: None };
        }

        let finished = Arc::clone(&done);
        let handle = thread::spawn(move || {
            while !finished.load(Ordering::SeqCst) {
                match event::poll(PROCESS_CHECK_INTERVAL) {
                    Ok(true) => {
                        if let Ok(Event::Key(key)) = event::read()
                            && is_cancel_key(&key)
                        {
                            cancel.store(true, Ordering::SeqCst);
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        debug!("Key listener stopped: {err}");
                        break;
                    }
                }
            }
        });

        Self {
            done,
            handle: Some(handle),
        }
    }
}

impl Drop for KeyListener {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            let _ = terminal::disable_raw_mode();
        }
    }
}

fn mirror<R, W>(source: R, sink: Arc<Mutex<W>>, log: Arc<Mutex<std::fs::File>>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines().map_while(Result::ok) {
            if let Ok(mut out) = sink.lock() {
                // Raw mode disables newline translation.
                let _ = write!(out, "{line}\r\n");
                let _ = out.flush();
            }
            if let Ok(mut file) = log.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    })
}

/// Runs `descriptor` attached to this CLI until it exits or `cancel` is raised.
///
/// The PID file is held for the duration so `status` sees the run.
pub fn run_foreground<W>(
    descriptor: &ServiceDescriptor,
    probe: &dyn ProcessProbe,
    cancel: Arc<AtomicBool>,
    stop_timeout: Duration,
    out: W,
) -> Result<ForegroundExit, StackError>
where
    W: Write + Send + 'static,
{
    let name = descriptor.name.as_str();
    let start_err = |source| StackError::ServiceStartError {
        service: name.to_string(),
        source,
    };

    if let Some(parent) = descriptor.log_file.parent() {
        std::fs::create_dir_all(parent).map_err(start_err)?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&descriptor.log_file)
        .map_err(start_err)?;
    let log = Arc::new(Mutex::new(log));

    let mut cmd = build_command(descriptor);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        // Own process group, so stop signals reach children of shell wrappers too.
        cmd.process_group(0);
    }
    let mut child = cmd.spawn().map_err(start_err)?;
    let pid = child.id();
    info!("Running '{name}' in the foreground (PID {pid}); press q or Ctrl-T to stop");

    let pid_file = PidFile::new(&descriptor.pid_file);
    pid_file.write(pid)?;

    let sink = Arc::new(Mutex::new(out));
    let mut mirrors = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        mirrors.push(mirror(stdout, Arc::clone(&sink), Arc::clone(&log)));
    }
    if let Some(stderr) = child.stderr.take() {
        mirrors.push(mirror(stderr, Arc::clone(&sink), Arc::clone(&log)));
    }

    let listener = KeyListener::spawn(Arc::clone(&cancel));
    let outcome = supervise(&mut child, name, probe, &cancel, stop_timeout, listener);

    for handle in mirrors {
        let _ = handle.join();
    }
    pid_file.remove()?;

    let (status, cancelled) = outcome?;
    info!("Foreground run of '{name}' ended ({status})");
    Ok(ForegroundExit {
        code: status.code(),
        cancelled,
    })
}

fn supervise(
    child: &mut std::process::Child,
    name: &str,
    probe: &dyn ProcessProbe,
    cancel: &AtomicBool,
    stop_timeout: Duration,
    listener: KeyListener,
) -> Result<(ExitStatus, bool), StackError> {
    let stop_err = |source| StackError::ServiceStopError {
        service: name.to_string(),
        source,
    };
    let pid = child.id();

    loop {
        if let Some(status) = child.try_wait().map_err(stop_err)? {
            return Ok((status, false));
        }
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(PROCESS_CHECK_INTERVAL);
    }

    // Leave raw mode before logging to stderr.
    drop(listener);
    info!("Stopping foreground service '{name}' (PID {pid})");
    probe.terminate(pid).map_err(stop_err)?;

    let deadline = Instant::now() + stop_timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().map_err(stop_err)? {
            return Ok((status, true));
        }
        thread::sleep(PROCESS_CHECK_INTERVAL);
    }

    warn!("Service '{name}' ignored the stop request; killing it");
    probe.kill(pid).map_err(stop_err)?;
    let deadline = Instant::now() + KILL_CONFIRM_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait().map_err(stop_err)? {
            return Ok((status, true));
        }
        if Instant::now() >= deadline {
            return Err(StackError::ServiceStillAlive {
                service: name.to_string(),
                pid,
            });
        }
        thread::sleep(PROCESS_CHECK_INTERVAL);
    }
}
