//! Client operations behind each `vcache` subcommand.
//!
//! Every operation runs on one session. Files evicted by the server are
//! saved to the evicted directory when one is configured, and files read
//! are saved to the read directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use vcache_config::{log_client_debug, log_client_info, log_client_warn};
use vcache_ipc::{BytesInfo, Client, Compression, FileData, OpenFlags};

use crate::local;

#[derive(Debug, Clone)]
pub struct Options {
    pub socket: PathBuf,
    /// Pause after every server request
    pub delay: Duration,
    pub evicted_dir: Option<PathBuf>,
    pub read_dir: Option<PathBuf>,
    pub compression: Compression,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
}

impl Options {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            delay: Duration::ZERO,
            evicted_dir: None,
            read_dir: None,
            compression: Compression::Disabled,
            retry_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Runner {
    client: Client,
    options: Options,
}

impl Runner {
    /// Connect, retrying until the configured timeout, and open a session.
    pub fn connect(options: Options) -> Result<Self> {
        let client = Client::connect_with_retry(
            &options.socket,
            options.retry_interval,
            options.connect_timeout,
        )
        .with_context(|| format!("cannot reach server at {}", options.socket.display()))?
        .with_compression(options.compression);
        log_client_debug!("Connected", socket = options.socket.display().to_string());
        Ok(Self { client, options })
    }

    fn pause(&self) {
        if !self.options.delay.is_zero() {
            thread::sleep(self.options.delay);
        }
    }

    fn keep_evicted(&self, evicted: Vec<FileData>) -> Result<()> {
        if evicted.is_empty() {
            return Ok(());
        }
        match &self.options.evicted_dir {
            Some(dir) => {
                let bytes = local::save_files(dir, &evicted)
                    .with_context(|| format!("cannot save evicted files to {}", dir.display()))?;
                log_client_info!(
                    "Saved evicted files",
                    count = evicted.len(),
                    bytes = bytes,
                    dir = dir.display().to_string(),
                );
            }
            None => {
                for file in &evicted {
                    log_client_warn!("File evicted and discarded", name = file.path.relative());
                }
            }
        }
        Ok(())
    }

    /// Upload local files. A file already stored under the same name is an
    /// error and keeps its content.
    pub fn write_files(&mut self, files: &[PathBuf]) -> Result<()> {
        for file in files {
            let name = file_name(file)?;
            let content =
                fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;

            let evicted = self
                .client
                .open_file(name, OpenFlags::CREATE | OpenFlags::LOCK)
                .with_context(|| format!("create {} failed", name))?;
            self.keep_evicted(evicted)?;
            self.pause();
            let evicted = self
                .client
                .write_file(name, &content)
                .with_context(|| format!("write {} failed", name))?;
            self.keep_evicted(evicted)?;
            self.pause();
            self.client.unlock_file(name)?;
            self.pause();
            self.client.close_file(name)?;
            self.pause();

            log_client_info!("Wrote file", name = name, bytes = content.len());
        }
        Ok(())
    }

    /// Upload files found below `dir`; `limit == 0` uploads all of them.
    pub fn write_dir(&mut self, dir: &Path, limit: usize) -> Result<usize> {
        let files = local::collect_files(dir, limit);
        self.write_files(&files)?;
        Ok(files.len())
    }

    /// Append the content of local `source` to stored file `name`.
    pub fn append(&mut self, name: &str, source: &Path) -> Result<()> {
        let content =
            fs::read(source).with_context(|| format!("cannot read {}", source.display()))?;

        self.client.open_file(name, OpenFlags::LOCK)?;
        self.pause();
        let evicted = self
            .client
            .append_to_file(name, &content)
            .with_context(|| format!("append to {} failed", name))?;
        self.keep_evicted(evicted)?;
        self.pause();
        self.client.unlock_file(name)?;
        self.pause();
        self.client.close_file(name)?;
        self.pause();

        log_client_info!("Appended", name = name, bytes = content.len());
        Ok(())
    }

    /// Fetch stored files by name.
    pub fn read_files(&mut self, names: &[String]) -> Result<Vec<FileData>> {
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            self.client.open_file(name, OpenFlags::empty())?;
            self.pause();
            let content = self
                .client
                .read_file(name)
                .with_context(|| format!("read {} failed", name))?;
            self.pause();
            self.client.close_file(name)?;
            self.pause();
            log_client_info!("Read file", name = name.as_str(), bytes = content.len());
            files.push(FileData::new(name.as_str().into(), content));
        }
        self.keep_read(&files)?;
        Ok(files)
    }

    /// Fetch up to `n` stored files; `0` fetches everything readable.
    pub fn read_n(&mut self, n: u32) -> Result<Vec<FileData>> {
        let files = self.client.read_n_files(n)?;
        self.pause();
        log_client_info!("Read files", requested = n, returned = files.len());
        self.keep_read(&files)?;
        Ok(files)
    }

    fn keep_read(&self, files: &[FileData]) -> Result<()> {
        if let Some(dir) = &self.options.read_dir {
            local::save_files(dir, files)
                .with_context(|| format!("cannot save read files to {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn lock(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            self.client
                .lock_file(name)
                .with_context(|| format!("lock {} failed", name))?;
            self.pause();
            log_client_info!("Locked", name = name.as_str());
        }
        Ok(())
    }

    pub fn unlock(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            self.client
                .unlock_file(name)
                .with_context(|| format!("unlock {} failed", name))?;
            self.pause();
            log_client_info!("Unlocked", name = name.as_str());
        }
        Ok(())
    }

    /// Lock, then remove each file.
    pub fn remove(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            self.client.lock_file(name)?;
            self.pause();
            self.client
                .remove_file(name)
                .with_context(|| format!("remove {} failed", name))?;
            self.pause();
            log_client_info!("Removed", name = name.as_str());
        }
        Ok(())
    }

    /// Close the session; returns the payload bytes moved.
    pub fn finish(self) -> Result<BytesInfo> {
        let bytes = self.client.bytes_info();
        self.client.close()?;
        Ok(bytes)
    }
}

fn file_name(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("not a UTF-8 path: {}", path.display()))
}
