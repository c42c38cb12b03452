use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Run-wide JSONL file. Set once in main(), appended to by `events::emit`.
static JSONL_WRITER: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// Path of the JSONL file for one run, creating `dir` if needed.
///
/// Pattern: `<dir>/<group>_<scenario>_<YYYYMMDD-HHMMSS>.jsonl`, with `_2`,
/// `_3`... appended when a run in the same second already wrote one.
pub fn run_file(dir: &Path, group: &str, scenario: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let base = format!("{group}_{scenario}_{stamp}");

    let mut path = dir.join(format!("{base}.jsonl"));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{base}_{n}.jsonl"));
        n += 1;
    }
    Ok(path)
}

pub fn open(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    JSONL_WRITER
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "JSONL file already open"))
}

/// Append one line if a file is open; silently a no-op otherwise.
pub fn append(line: &str) {
    let Some(writer) = JSONL_WRITER.get() else {
        return;
    };
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{line}");
        let _ = w.flush();
    }
}
