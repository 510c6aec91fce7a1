//! Engine configuration.
//!
//! `EngineConfig` bundles the settings of the three layers of the engine:
//! - [`WorkerOptions`]: how the backend execution context is started,
//! - [`SessionConfig`]: document session and page behaviour,
//! - [`RenderConfig`]: how much work a render task does before yielding.
//!
//! Defaults come from [`Default`]; [`EngineConfig::builder()`] customizes and validates.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use folio_engine::config::EngineConfig;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = EngineConfig::builder()
//!     .disable_worker(true)
//!     .rendering_cancelled_grace(Duration::from_millis(250))
//!     .execution_steps(32)
//!     .build()?;
//! assert!(cfg.worker.disable_worker);
//! # Ok(()) }
//! ```
//!
//! # Errors
//!
//! Builder validation returns [`ConfigError`] for a zero `execution_steps`, a zero stream high water
//! mark or an empty worker name.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::errors::ConfigError;

const DEFAULT_WORKER_NAME: &str = "worker";

/// Log verbosity, shared with the backend through the `Configure` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Verbosity {
    Errors,
    #[default]
    Warnings,
    Infos,
    Debug,
}

impl Verbosity {
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Errors => log::LevelFilter::Error,
            Verbosity::Warnings => log::LevelFilter::Warn,
            Verbosity::Infos => log::LevelFilter::Info,
            Verbosity::Debug => log::LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Name of the worker thread
    pub name: String,
    /// Skip the worker thread and run the backend on a loopback channel
    pub disable_worker: bool,
    /// Move probe buffers instead of copying them
    pub post_message_transfers: bool,
    /// Verbosity forwarded to the backend
    pub verbosity: Verbosity,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_WORKER_NAME.to_string(),
            disable_worker: false,
            post_message_transfers: true,
            verbosity: Verbosity::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a cancelled render keeps its operator list stream alive, in case the page is
    /// rendered again right away.
    pub rendering_cancelled_grace: Duration,
    /// Flag pages for cleanup as soon as their renders complete
    pub cleanup_after_render: bool,
    /// Credit (in text items) granted to the text content stream
    pub text_content_high_water_mark: i64,
    /// Credit (in chunks) granted to the operator list stream
    pub operator_list_high_water_mark: i64,
    /// How long `destroy` waits for the backend to acknowledge `Terminate`
    pub terminate_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rendering_cancelled_grace: Duration::from_millis(100),
            cleanup_after_render: false,
            text_content_high_water_mark: 100,
            operator_list_high_water_mark: 16,
            terminate_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Instructions executed between two checks of the time budget
    pub execution_steps: usize,
    /// Time after which a render task yields back to the runtime
    pub execution_time: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            execution_steps: 10,
            execution_time: Duration::from_millis(15),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub worker: WorkerOptions,
    pub session: SessionConfig,
    pub render: RenderConfig,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    inner: EngineConfig,
}

impl EngineConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn worker_name<S: Into<String>>(self, name: S) -> Self { self.map(|c| c.worker.name = name.into()) }
    pub fn disable_worker(self, on: bool) -> Self { self.map(|c| c.worker.disable_worker = on) }
    pub fn post_message_transfers(self, on: bool) -> Self { self.map(|c| c.worker.post_message_transfers = on) }
    pub fn verbosity(self, verbosity: Verbosity) -> Self { self.map(|c| c.worker.verbosity = verbosity) }
    pub fn rendering_cancelled_grace(self, grace: Duration) -> Self { self.map(|c| c.session.rendering_cancelled_grace = grace) }
    pub fn cleanup_after_render(self, on: bool) -> Self { self.map(|c| c.session.cleanup_after_render = on) }
    pub fn text_content_high_water_mark(self, hwm: i64) -> Self { self.map(|c| c.session.text_content_high_water_mark = hwm) }
    pub fn operator_list_high_water_mark(self, hwm: i64) -> Self { self.map(|c| c.session.operator_list_high_water_mark = hwm) }
    pub fn terminate_timeout(self, timeout: Duration) -> Self { self.map(|c| c.session.terminate_timeout = timeout) }
    pub fn execution_steps(self, steps: usize) -> Self { self.map(|c| c.render.execution_steps = steps) }
    pub fn execution_time(self, time: Duration) -> Self { self.map(|c| c.render.execution_time = time) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut EngineConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

fn validate(c: &EngineConfig) -> Result<(), ConfigError> {
    if c.worker.name.is_empty() {
        return Err(ConfigError::EmptyWorkerName);
    }
    if c.render.execution_steps == 0 {
        return Err(ConfigError::ZeroExecutionSteps);
    }
    if c.session.text_content_high_water_mark < 1 {
        return Err(ConfigError::InvalidHighWaterMark {
            stream: "text content",
            value: c.session.text_content_high_water_mark,
        });
    }
    if c.session.operator_list_high_water_mark < 1 {
        return Err(ConfigError::InvalidHighWaterMark {
            stream: "operator list",
            value: c.session.operator_list_high_water_mark,
        });
    }
    Ok(())
}
