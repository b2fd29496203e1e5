//! Spinner shown on stderr while a long external command runs.
use std::{
    io::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use terminal_size::{Width, terminal_size_of};

use crate::constants::PROGRESS_TICK;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

/// Background ticker; stops and clears its line when dropped.
///
/// Nothing is drawn when stderr is not a terminal.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start(label: impl Into<String>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let Some((Width(width), _)) = terminal_size_of(io::stderr()) else {
            return Self { stop, handle: None };
        };

        let label = label.into();
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let mut frame = 0usize;
            let mut stderr = io::stderr();
            while !flag.load(Ordering::Relaxed) {
                let line = render_line(
                    &label,
                    FRAMES[frame % FRAMES.len()],
                    started.elapsed().as_secs(),
                    width as usize,
                );
                let _ = write!(stderr, "\r{line}");
                let _ = stderr.flush();
                frame += 1;
                thread::sleep(PROGRESS_TICK);
            }
            let _ = write!(stderr, "\r{}\r", " ".repeat(width as usize));
            let _ = stderr.flush();
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn render_line(label: &str, frame: char, elapsed_secs: u64, width: usize) -> String {
    let line = format!("{frame} {label} ({elapsed_secs}s)");
    if width == 0 || line.chars().count() < width {
        return line;
    }
    line.chars().take(width.saturating_sub(1)).collect()
}
