use chrono::{Local, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

use crate::config::Rotation;
use crate::error::{ErrorList, FasthttpdResult};

/// A writable log sink that supports an atomic rotate operation.
pub trait Rotator: Send + Sync {
    fn write(&self, buf: &[u8]) -> io::Result<()>;
    fn rotate(&self) -> io::Result<()>;
}

impl std::fmt::Debug for dyn Rotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Rotator").finish()
    }
}

/// A sink with a no-op rotate: stdout, stderr or discard.
pub struct NopRotator {
    sink: NopSink,
}

enum NopSink {
    Stdout,
    Stderr,
    Discard,
}

impl Rotator for NopRotator {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        match self.sink {
            NopSink::Stdout => io::stdout().lock().write_all(buf),
            NopSink::Stderr => io::stderr().lock().write_all(buf),
            NopSink::Discard => Ok(()),
        }
    }

    fn rotate(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A discarding sink for hosts with no log output configured.
pub fn nil_rotator() -> Arc<dyn Rotator> {
    Arc::new(NopRotator {
        sink: NopSink::Discard,
    })
}

struct FileState {
    file: File,
    size: u64,
}

/// A size-rotating file sink with backup management: rotated files carry a
/// timestamp suffix, are optionally gzip-compressed, and are pruned by
/// count and age.
pub struct FileRotator {
    path: PathBuf,
    cfg: Rotation,
    state: Mutex<FileState>,
}

impl FileRotator {
    pub fn new(path: impl Into<PathBuf>, cfg: Rotation) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            cfg,
            state: Mutex::new(FileState { file, size }),
        })
    }

    fn max_bytes(&self) -> u64 {
        self.cfg.max_size.max(1) * 1024 * 1024
    }

    fn backup_path(&self) -> PathBuf {
        let stamp = if self.cfg.local_time {
            Local::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string()
        } else {
            Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string()
        };
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "log".to_string());
        let ext = self
            .path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        self.path
            .with_file_name(format!("{}-{}{}", stem, stamp, ext))
    }

    fn rotate_locked(&self, state: &mut FileState) -> io::Result<()> {
        state.file.flush()?;
        let backup = self.backup_path();
        std::fs::rename(&self.path, &backup)?;
        state.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        state.size = 0;

        let compress = self.cfg.compress;
        let dir = self.path.parent().map(Path::to_path_buf);
        let stem_prefix = format!(
            "{}-",
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "log".to_string())
        );
        let max_backups = self.cfg.max_backups;
        let max_age = self.cfg.max_age;
        let housekeeping = move || {
            if compress {
                if let Err(err) = compress_file(&backup) {
                    warn!(path = %backup.display(), "failed to compress rotated log: {}", err);
                }
            }
            if let Some(dir) = dir {
                if let Err(err) = prune_backups(&dir, &stem_prefix, max_backups, max_age) {
                    warn!(dir = %dir.display(), "failed to prune rotated logs: {}", err);
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { tokio::task::spawn_blocking(housekeeping).await.ok(); });
            }
            Err(_) => housekeeping(),
        }
        Ok(())
    }
}

impl Rotator for FileRotator {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().expect("rotator lock poisoned");
        if state.size + buf.len() as u64 > self.max_bytes() {
            self.rotate_locked(&mut state)?;
        }
        state.file.write_all(buf)?;
        state.size += buf.len() as u64;
        Ok(())
    }

    fn rotate(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("rotator lock poisoned");
        self.rotate_locked(&mut state)
    }
}

fn compress_file(path: &Path) -> io::Result<()> {
    let gz_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(".gz");
        PathBuf::from(name)
    };
    let mut input = File::open(path)?;
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    std::fs::remove_file(path)
}

fn prune_backups(dir: &Path, stem_prefix: &str, max_backups: usize, max_age_days: i64) -> io::Result<()> {
    let mut backups: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(stem_prefix) {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            backups.push((entry.path(), modified));
        }
    }
    backups.sort_by_key(|(_, modified)| *modified);

    if max_backups > 0 && backups.len() > max_backups {
        let excess = backups.len() - max_backups;
        for (path, _) in backups.drain(..excess) {
            std::fs::remove_file(path)?;
        }
    }
    if max_age_days > 0 {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(max_age_days as u64 * 24 * 3600);
        for (path, modified) in backups {
            if modified < cutoff {
                std::fs::remove_file(path)?;
            }
        }
    }
    Ok(())
}

static SHARED_ROTATORS: Lazy<Mutex<HashMap<String, Weak<dyn Rotator>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the rotator mapped to `output`, creating it on first use.
/// Opening the same path from two configurations yields the same sink; a
/// later configuration's rotation settings are ignored.
pub fn shared_rotator(output: &str, cfg: &Rotation) -> FasthttpdResult<Arc<dyn Rotator>> {
    let mut shared = SHARED_ROTATORS.lock().expect("rotator registry poisoned");
    if let Some(existing) = shared.get(output).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    let rotator: Arc<dyn Rotator> = match output {
        "" => nil_rotator(),
        "stdout" => Arc::new(NopRotator {
            sink: NopSink::Stdout,
        }),
        "stderr" => Arc::new(NopRotator {
            sink: NopSink::Stderr,
        }),
        path => Arc::new(FileRotator::new(path, cfg.clone())?),
    };
    shared.insert(output.to_string(), Arc::downgrade(&rotator));
    Ok(rotator)
}

/// Rotates every live shared rotator, joining failures into one error.
pub fn rotate_shared() -> FasthttpdResult<()> {
    let rotators: Vec<Arc<dyn Rotator>> = {
        let mut shared = SHARED_ROTATORS.lock().expect("rotator registry poisoned");
        shared.retain(|_, weak| weak.strong_count() > 0);
        shared.values().filter_map(Weak::upgrade).collect()
    };
    let mut errs = ErrorList::default();
    for rotator in rotators {
        if let Err(err) = rotator.rotate() {
            errs.push(err);
        }
    }
    errs.into_result("rotate")
}
