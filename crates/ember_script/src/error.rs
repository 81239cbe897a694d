use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while driving the embedded interpreter.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("interpreter has not been initialized")]
    NotInitialized,

    #[error("script module '{name}' not found in {searched} search path entries")]
    ModuleNotFound { name: String, searched: usize },

    #[error("embedded module '{name}' has not been loaded")]
    EmbeddedModuleMissing { name: String },

    #[error("script evaluation failed in '{context}': {detail}")]
    Eval { context: String, detail: String },

    #[error("interpreter runtime error: {0}")]
    Runtime(#[from] rquickjs::Error),

    #[error("failed to read module source '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ScriptError>;
