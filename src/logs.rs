//! Reading and following native service log files.
use std::{
    fs::File,
    io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use tracing::debug;

use crate::constants::{LOG_FOLLOW_INTERVAL, LOG_TAIL_WINDOW};

/// Returns the last `lines` lines of `path`.
///
/// Only the end of the file is read; the window grows until it holds enough lines or
/// covers the whole file. A missing file yields no lines.
pub fn read_recent_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("Log file {} does not exist yet", path.display());
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };

    let len = file.metadata()?.len();
    let mut window = LOG_TAIL_WINDOW.min(len);

    loop {
        let offset = len - window;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(window as usize);
        Read::by_ref(&mut file).take(window).read_to_end(&mut buf)?;

        let text = String::from_utf8_lossy(&buf);
        let mut collected: Vec<&str> = text.lines().collect();
        // A partial first line is only trustworthy once we reached the file start.
        if offset > 0 && !collected.is_empty() {
            collected.remove(0);
        }

        if collected.len() >= lines || offset == 0 {
            let start = collected.len().saturating_sub(lines);
            return Ok(collected[start..].iter().map(|l| l.to_string()).collect());
        }

        window = (window * 2).min(len);
    }
}

/// Prints the last `lines` lines of `path` and then streams appended output until
/// `stop` is raised.
pub fn follow(
    path: &Path,
    lines: usize,
    stop: &AtomicBool,
    out: &mut dyn Write,
) -> io::Result<()> {
    for line in read_recent_lines(path, lines)? {
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    let mut position = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => 0,
        Err(err) => return Err(err),
    };

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(LOG_FOLLOW_INTERVAL);

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        let len = file.metadata()?.len();
        if len < position {
            debug!("Log file {} was truncated; rewinding", path.display());
            position = 0;
        }
        if len == position {
            continue;
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(position))?;
        let mut chunk = String::new();
        loop {
            chunk.clear();
            let read = reader.read_line(&mut chunk)?;
            if read == 0 || !chunk.ends_with('\n') {
                break;
            }
            position += read as u64;
            out.write_all(chunk.as_bytes())?;
        }
        out.flush()?;
    }

    Ok(())
}
