//! Ember Scripting Bridge
//!
//! Hosts a QuickJS interpreter inside a native process:
//! - Interpreter lifecycle and module search paths
//! - Execution-lock handoff across native worker threads
//! - Zero-copy publication of native buffers and scalars to script code
//!
//! Non-Rust hosts (C, C++, Fortran) drive the same surface through the
//! flat `ember_abi` crate.

pub mod config;
pub mod error;
pub mod fpe;
pub mod interp;
pub mod lock;
pub mod publish;

pub use config::InterpreterConfig;
pub use error::{Result, ScriptError};
pub use fpe::FpeGuard;
pub use interp::EmbeddedInterpreter;
pub use lock::{ExecutionLock, ThreadKey};
pub use publish::Element;

pub use rquickjs;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
