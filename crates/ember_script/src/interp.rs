//! Embedded interpreter lifecycle and module registry
//!
//! Owns the QuickJS runtime, the ordered module search path, and the two
//! module registries: modules the native side loads to call into, and
//! embedded modules that receive values published from native code.

use crate::config::InterpreterConfig;
use crate::error::{Result, ScriptError};
use crate::fpe::FpeGuard;
use crate::lock::{ExecutionLock, ThreadKey};
use rquickjs::{Array, Context, Ctx, Function, Object, Persistent, Runtime};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Handle to a module's exports object, kept alive across context scopes.
pub(crate) type ModuleRef = Persistent<Object<'static>>;

pub(crate) struct JsEngine {
    #[allow(dead_code)] // Kept alive for context lifetime
    runtime: Runtime,
    pub(crate) context: Context,
}

pub(crate) struct InterpState {
    pub(crate) search_paths: Vec<PathBuf>,
    pub(crate) loaded: HashMap<String, ModuleRef>,
    pub(crate) embedded: HashMap<String, ModuleRef>,
    // Declared last: module references must drop before the runtime that
    // owns them.
    pub(crate) js: Option<JsEngine>,
}

/// Hosted script interpreter.
///
/// One instance per process. `initialize` must precede every other call;
/// worker threads coordinate access through the execution lock (see
/// [`crate::lock`]).
pub struct EmbeddedInterpreter {
    lock: ExecutionLock,
    auto_load: AtomicBool,
    state: Mutex<InterpState>,
}

impl EmbeddedInterpreter {
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::default())
    }

    pub fn with_config(config: InterpreterConfig) -> Self {
        Self {
            lock: ExecutionLock::new(),
            auto_load: AtomicBool::new(config.auto_load),
            state: Mutex::new(InterpState {
                search_paths: config.search_paths,
                loaded: HashMap::new(),
                embedded: HashMap::new(),
                js: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, InterpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Brings up the interpreter. On an already-live instance (a process
    /// embedding the interpreter more than once) this instead captures the
    /// calling thread's execution state and pre-sizes per-thread lock
    /// storage for an upcoming parallel region. The runtime-side search
    /// path state is (re)installed either way.
    pub fn initialize(&self) -> Result<()> {
        let mut st = self.state();
        let _fpe = FpeGuard::hold();
        if st.js.is_none() {
            let runtime = Runtime::new()?;
            let context = Context::full(&runtime)?;
            context.with(|ctx| -> rquickjs::Result<()> {
                let print = Function::new(ctx.clone(), |message: String| {
                    tracing::info!("[js] {}", message);
                })?;
                ctx.globals().set("print", print)?;
                Ok(())
            })?;
            st.js = Some(JsEngine { runtime, context });
            self.lock.adopt(ThreadKey::current());
            tracing::debug!("interpreter started");
        } else {
            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            self.lock.reserve_slots(workers + 1);
            self.lock.adopt(ThreadKey::current());
        }
        if let Some(js) = st.js.as_ref() {
            Self::sync_search_paths(js, &st.search_paths)?;
        }
        Ok(())
    }

    /// Clears the search path and the loaded-module registry. Embedded
    /// modules stay registered: their published accessors may still be
    /// referenced by script state. Safe to call repeatedly or after a
    /// failed `initialize`.
    pub fn finalize(&self) {
        let mut st = self.state();
        st.search_paths.clear();
        st.loaded.clear();
        if let Some(js) = st.js.as_ref() {
            let _fpe = FpeGuard::hold();
            let _ = Self::sync_search_paths(js, &st.search_paths);
        }
        tracing::debug!("interpreter finalized");
    }

    pub fn threading_init(&self) {
        self.lock.threading_init();
    }

    pub fn threading_start(&self) {
        self.lock.threading_start();
    }

    pub fn threading_stop(&self) {
        self.lock.threading_stop();
    }

    pub fn threading_finalize(&self) {
        self.lock.threading_finalize();
    }

    /// The interpreter's execution lock, for inspection and advanced
    /// handoff schemes.
    pub fn execution_lock(&self) -> &ExecutionLock {
        &self.lock
    }

    pub fn auto_load(&self) -> bool {
        self.auto_load.load(Ordering::Relaxed)
    }

    /// Controls whether publishing into an unregistered embedded module
    /// loads it on the spot instead of failing.
    pub fn set_auto_load(&self, enabled: bool) {
        self.auto_load.store(enabled, Ordering::Relaxed);
    }

    /// Appends a directory to the module search path and mirrors it into
    /// the runtime. Duplicates are kept; append order is resolution
    /// priority.
    pub fn add_to_scope(&self, directory: impl Into<PathBuf>) -> Result<()> {
        let directory = directory.into();
        let mut guard = self.state();
        let st = &mut *guard;
        let js = st.js.as_ref().ok_or(ScriptError::NotInitialized)?;
        st.search_paths.push(directory.clone());
        let _fpe = FpeGuard::hold();
        js.context.with(|ctx| -> rquickjs::Result<()> {
            let list: Array = ctx.globals().get("__modulePaths")?;
            list.set(list.len(), directory.display().to_string())?;
            Ok(())
        })?;
        tracing::debug!(directory = %directory.display(), "search path extended");
        Ok(())
    }

    /// Resolves `name` through the search path and (re)binds it in the
    /// loaded-module registry.
    pub fn module_load(&self, name: &str) -> Result<()> {
        let mut guard = self.state();
        let st = &mut *guard;
        let js = st.js.as_ref().ok_or(ScriptError::NotInitialized)?;
        let path = Self::resolve_module(&st.search_paths, name).ok_or_else(|| {
            ScriptError::ModuleNotFound {
                name: name.to_string(),
                searched: st.search_paths.len(),
            }
        })?;
        let _fpe = FpeGuard::hold();
        let module = Self::eval_module(js, name, &path)?;
        st.loaded.insert(name.to_string(), module);
        tracing::debug!(module = name, path = %path.display(), "module loaded");
        Ok(())
    }

    /// Invokes `function` from a loaded module with no arguments and drops
    /// any return value; side effects happen inside the script. A module or
    /// function that is not present is reported and skipped, not raised.
    pub fn module_call(&self, name: &str, function: &str) -> Result<()> {
        let guard = self.state();
        let js = guard.js.as_ref().ok_or(ScriptError::NotInitialized)?;
        let Some(module) = guard.loaded.get(name).cloned() else {
            tracing::warn!(
                module = name,
                function,
                "module is not loaded, function not executed"
            );
            return Ok(());
        };
        let _fpe = FpeGuard::hold();
        js.context.with(|ctx| {
            let namespace = module.restore(&ctx)?;
            let callee: Option<Function> = namespace.get(function)?;
            match callee {
                Some(callee) => {
                    callee
                        .call::<_, ()>(())
                        .map_err(|err| eval_error(&ctx, name, err))?;
                }
                None => {
                    tracing::warn!(
                        module = name,
                        function,
                        "module does not contain function, not executed"
                    );
                }
            }
            Ok(())
        })
    }

    /// Loads `name` into the embedded-module registry and publishes its
    /// exports object as a runtime global, so script code can reach the
    /// attributes the native side publishes into it.
    pub fn embedded_module_load(&self, name: &str) -> Result<()> {
        let mut guard = self.state();
        Self::embedded_load_into(&mut guard, name)
    }

    pub(crate) fn embedded_load_into(st: &mut InterpState, name: &str) -> Result<()> {
        let js = st.js.as_ref().ok_or(ScriptError::NotInitialized)?;
        let path = Self::resolve_module(&st.search_paths, name).ok_or_else(|| {
            ScriptError::ModuleNotFound {
                name: name.to_string(),
                searched: st.search_paths.len(),
            }
        })?;
        let _fpe = FpeGuard::hold();
        let module = Self::eval_module(js, name, &path)?;
        js.context.with(|ctx| -> rquickjs::Result<()> {
            let namespace = module.clone().restore(&ctx)?;
            ctx.globals().set(name, namespace)?;
            Ok(())
        })?;
        st.embedded.insert(name.to_string(), module);
        tracing::debug!(module = name, "embedded module loaded");
        Ok(())
    }

    /// Publish gate: the target embedded module must already be registered,
    /// unless auto-load is enabled, in which case it is loaded on the spot.
    pub(crate) fn check_embedded_loaded(&self, st: &mut InterpState, name: &str) -> Result<()> {
        if st.embedded.contains_key(name) {
            return Ok(());
        }
        if self.auto_load() {
            return Self::embedded_load_into(st, name);
        }
        Err(ScriptError::EmbeddedModuleMissing {
            name: name.to_string(),
        })
    }

    pub fn is_module_loaded(&self, name: &str) -> bool {
        self.state().loaded.contains_key(name)
    }

    pub fn is_embedded_module_loaded(&self, name: &str) -> bool {
        self.state().embedded.contains_key(name)
    }

    /// Evaluates a source snippet in the interpreter's global scope and
    /// converts the result. Host-side hook for demos and tests.
    pub fn eval<T: for<'js> rquickjs::FromJs<'js>>(&self, source: &str) -> Result<T> {
        let guard = self.state();
        let js = guard.js.as_ref().ok_or(ScriptError::NotInitialized)?;
        let _fpe = FpeGuard::hold();
        js.context
            .with(|ctx| ctx.eval(source).map_err(|err| eval_error(&ctx, "<eval>", err)))
    }

    /// Evaluates a source snippet for its side effects.
    pub fn execute(&self, source: &str) -> Result<()> {
        self.eval::<()>(source)
    }

    fn sync_search_paths(js: &JsEngine, paths: &[PathBuf]) -> Result<()> {
        js.context.with(|ctx| -> rquickjs::Result<()> {
            let list = Array::new(ctx.clone())?;
            for (index, dir) in paths.iter().enumerate() {
                list.set(index, dir.display().to_string())?;
            }
            ctx.globals().set("__modulePaths", list)?;
            Ok(())
        })?;
        Ok(())
    }

    /// First match over the ordered search path wins. Dots in module names
    /// map to path separators, mirroring how the runtime resolves imports.
    fn resolve_module(paths: &[PathBuf], name: &str) -> Option<PathBuf> {
        let relative = format!("{}.js", name.replace('.', "/"));
        paths
            .iter()
            .map(|dir| dir.join(&relative))
            .find(|candidate| candidate.is_file())
    }

    fn eval_module(js: &JsEngine, name: &str, path: &Path) -> Result<ModuleRef> {
        let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // Module sources attach their entry points to `exports`; the
        // wrapper keeps top-level declarations out of the global scope.
        let wrapped = format!(
            "(function() {{ \"use strict\"; const exports = {{}}; \
             const module = {{ exports: exports }};\n{source}\n;return module.exports; }})()"
        );
        js.context.with(|ctx| {
            let namespace: Object = ctx
                .eval(wrapped)
                .map_err(|err| eval_error(&ctx, name, err))?;
            Ok(Persistent::save(&ctx, namespace))
        })
    }
}

impl Default for EmbeddedInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls the pending exception out of the context when there is one, so the
/// error carries the script-side message instead of a bare "exception".
pub(crate) fn eval_error(ctx: &Ctx<'_>, what: &str, err: rquickjs::Error) -> ScriptError {
    if matches!(err, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        ScriptError::Eval {
            context: what.to_string(),
            detail: format!("{caught:?}"),
        }
    } else {
        ScriptError::Runtime(err)
    }
}
