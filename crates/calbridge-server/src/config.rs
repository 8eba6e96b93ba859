//! Worker and daemon configuration.

use std::path::PathBuf;

use calbridge_providers::SyncConfig;

/// Settings of the worker thread.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub thread_name: String,
    /// Threads of the worker's own multi-threaded runtime.
    pub worker_threads: usize,
    /// Capacity of the in-process byte pipe between both bridge ends.
    pub pipe_capacity: usize,
    pub sync: SyncConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "calbridge-worker".to_string(),
            worker_threads: 2,
            pipe_capacity: 64 * 1024,
            sync: SyncConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}

/// Settings of the Unix socket daemon.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Directory of the database snapshot; in memory when `None`.
    pub data_dir: Option<PathBuf>,
    pub max_connections: usize,
    /// Whether to remove a stale socket file on startup.
    pub cleanup_stale_socket: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            data_dir: None,
            max_connections: 32,
            cleanup_stale_socket: true,
        }
    }
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }
}

/// `$XDG_RUNTIME_DIR/calbridge.sock`, or `/tmp/calbridge-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("calbridge.sock")
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/calbridge-{}.sock", uid))
    }
}
