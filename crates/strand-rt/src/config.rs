// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime tunables.
//!
//! A TOML file maps onto [`RuntimeConfig`]; [`RuntimeConfig::apply`] pushes
//! it into the process-wide [`ConfigVar`]s that the runtime reads. Each
//! variable notifies its listeners when the value actually changes, so a
//! component can cache a value and stay current.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default coroutine stack: 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
/// Smallest stack accepted from configuration.
pub const MIN_STACK_SIZE: usize = 16 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
/// Upper bound on a single reactor wait.
pub const DEFAULT_MAX_POLL_MS: u64 = 3000;
pub const DEFAULT_FD_CAPACITY: usize = 64;

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A named, live-updatable configuration value.
pub struct ConfigVar<T> {
    name: &'static str,
    description: &'static str,
    value: RwLock<T>,
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
    next_listener: AtomicU64,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ConfigVar<T> {
    pub fn new(name: &'static str, default: T, description: &'static str) -> Self {
        Self {
            name,
            description,
            value: RwLock::new(default),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value. Listeners run on the calling thread, after the
    /// lock is released, and only if the value changed.
    pub fn set(&self, value: T) {
        let old = {
            let mut guard = self.value.write();
            if *guard == value {
                return;
            }
            std::mem::replace(&mut *guard, value.clone())
        };

        let listeners: Vec<Listener<T>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in listeners {
            cb(&old, &value);
        }
    }

    /// Register a change listener. Returns an id for [`Self::remove_listener`].
    pub fn add_listener<F>(&self, cb: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(cb)));
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &*self.value.read())
            .finish()
    }
}

/// Default stack size for new coroutines, in bytes.
pub fn stack_size() -> &'static ConfigVar<usize> {
    static VAR: OnceLock<ConfigVar<usize>> = OnceLock::new();
    VAR.get_or_init(|| {
        ConfigVar::new(
            "coroutine.stack_size",
            DEFAULT_STACK_SIZE,
            "coroutine stack size in bytes",
        )
    })
}

/// Default timeout for hooked `connect`, in milliseconds. 0 disables it.
pub fn connect_timeout_ms() -> &'static ConfigVar<u64> {
    static VAR: OnceLock<ConfigVar<u64>> = OnceLock::new();
    VAR.get_or_init(|| {
        ConfigVar::new(
            "tcp.connect_timeout_ms",
            DEFAULT_CONNECT_TIMEOUT_MS,
            "tcp connect timeout",
        )
    })
}

/// Longest single multiplexer wait. Read when a reactor is created.
pub fn max_poll_ms() -> &'static ConfigVar<u64> {
    static VAR: OnceLock<ConfigVar<u64>> = OnceLock::new();
    VAR.get_or_init(|| {
        ConfigVar::new(
            "reactor.max_poll_ms",
            DEFAULT_MAX_POLL_MS,
            "maximum epoll wait in milliseconds",
        )
    })
}

/// Initial size of the reactor's fd slot arena.
pub fn initial_fd_capacity() -> &'static ConfigVar<usize> {
    static VAR: OnceLock<ConfigVar<usize>> = OnceLock::new();
    VAR.get_or_init(|| {
        ConfigVar::new(
            "reactor.initial_fd_capacity",
            DEFAULT_FD_CAPACITY,
            "initial fd slot count",
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoroutineConfig {
    pub stack_size: usize,
}

impl Default for CoroutineConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub max_poll_ms: u64,
    pub initial_fd_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_poll_ms: DEFAULT_MAX_POLL_MS,
            initial_fd_capacity: DEFAULT_FD_CAPACITY,
        }
    }
}

/// File-level configuration.
///
/// ```toml
/// [coroutine]
/// stack_size = 262144
///
/// [tcp]
/// connect_timeout_ms = 2000
///
/// [reactor]
/// max_poll_ms = 1000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub coroutine: CoroutineConfig,
    pub tcp: TcpConfig,
    pub reactor: ReactorConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coroutine.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::Invalid {
                key: "coroutine.stack_size",
                reason: format!("{} is below the {MIN_STACK_SIZE} byte minimum", self.coroutine.stack_size),
            });
        }
        if self.reactor.max_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "reactor.max_poll_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.reactor.initial_fd_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "reactor.initial_fd_capacity",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Push these values into the live variables, firing change listeners.
    pub fn apply(&self) {
        stack_size().set(self.coroutine.stack_size);
        connect_timeout_ms().set(self.tcp.connect_timeout_ms);
        max_poll_ms().set(self.reactor.max_poll_ms);
        initial_fd_capacity().set(self.reactor.initial_fd_capacity);
        tracing::info!(?self, "runtime config applied");
    }
}
