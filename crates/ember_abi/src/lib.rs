//! Flat C-ABI surface over the embedding layer
//!
//! Lets non-object-oriented callers (C, C++, Fortran) drive the interpreter
//! through an opaque handle, null-terminated strings, and raw buffer
//! pointers. Declarations for C callers live in `include/ember_interp.h`.
//!
//! Nothing Rust-shaped crosses this boundary: recoverable conditions are
//! logged and skipped inside the core layer, fatal conditions are logged
//! and terminate the process, and panics are caught and turned into aborts.

use ember_script::{Element, EmbeddedInterpreter};
use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process;

/// Runs `body`, turning a panic into process termination instead of
/// undefined behavior in the foreign caller.
fn shielded<R>(what: &str, body: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(call = what, "panic reached the native boundary, aborting");
            process::abort();
        }
    }
}

fn fatal(what: &str, err: ember_script::ScriptError) -> ! {
    tracing::error!(call = what, error = %err, "fatal interpreter error");
    process::abort();
}

unsafe fn deref<'a>(what: &str, handle: *mut EmbeddedInterpreter) -> &'a EmbeddedInterpreter {
    if handle.is_null() {
        tracing::error!(call = what, "null interpreter handle");
        process::abort();
    }
    &*handle
}

unsafe fn text<'a>(what: &str, ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        tracing::error!(call = what, "null string argument");
        process::abort();
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(text) => text,
        Err(_) => {
            tracing::error!(call = what, "string argument is not valid UTF-8");
            process::abort();
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_ctor(handle_out: *mut *mut EmbeddedInterpreter) {
    shielded("ember_interp_ctor", || {
        // First-wins: a host that already configured logging keeps its own.
        let _ = tracing_subscriber::fmt::try_init();
        if handle_out.is_null() {
            tracing::error!("ember_interp_ctor: null output handle");
            process::abort();
        }
        *handle_out = Box::into_raw(Box::new(EmbeddedInterpreter::new()));
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_dtor(handle_out: *mut *mut EmbeddedInterpreter) {
    shielded("ember_interp_dtor", || {
        if handle_out.is_null() || (*handle_out).is_null() {
            return;
        }
        drop(Box::from_raw(*handle_out));
        *handle_out = std::ptr::null_mut();
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_initialize(handle: *mut EmbeddedInterpreter) {
    shielded("ember_interp_initialize", || {
        if let Err(err) = deref("ember_interp_initialize", handle).initialize() {
            fatal("ember_interp_initialize", err);
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_finalize(handle: *mut EmbeddedInterpreter) {
    shielded("ember_interp_finalize", || {
        deref("ember_interp_finalize", handle).finalize();
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_threading_init(handle: *mut EmbeddedInterpreter) {
    shielded("ember_interp_threading_init", || {
        deref("ember_interp_threading_init", handle).threading_init();
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_threading_start(handle: *mut EmbeddedInterpreter) {
    shielded("ember_interp_threading_start", || {
        deref("ember_interp_threading_start", handle).threading_start();
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_threading_stop(handle: *mut EmbeddedInterpreter) {
    shielded("ember_interp_threading_stop", || {
        deref("ember_interp_threading_stop", handle).threading_stop();
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_threading_finalize(handle: *mut EmbeddedInterpreter) {
    shielded("ember_interp_threading_finalize", || {
        deref("ember_interp_threading_finalize", handle).threading_finalize();
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_add_to_scope(
    handle: *mut EmbeddedInterpreter,
    directory: *const c_char,
) {
    shielded("ember_interp_add_to_scope", || {
        let interp = deref("ember_interp_add_to_scope", handle);
        let directory = text("ember_interp_add_to_scope", directory);
        if let Err(err) = interp.add_to_scope(directory) {
            fatal("ember_interp_add_to_scope", err);
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_module_load(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
) {
    shielded("ember_interp_module_load", || {
        let interp = deref("ember_interp_module_load", handle);
        let module = text("ember_interp_module_load", module);
        if let Err(err) = interp.module_load(module) {
            fatal("ember_interp_module_load", err);
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_module_call(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    function: *const c_char,
) {
    shielded("ember_interp_module_call", || {
        let interp = deref("ember_interp_module_call", handle);
        let module = text("ember_interp_module_call", module);
        let function = text("ember_interp_module_call", function);
        if let Err(err) = interp.module_call(module, function) {
            fatal("ember_interp_module_call", err);
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embedded_module_load(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
) {
    shielded("ember_interp_embedded_module_load", || {
        let interp = deref("ember_interp_embedded_module_load", handle);
        let module = text("ember_interp_embedded_module_load", module);
        if let Err(err) = interp.embedded_module_load(module) {
            fatal("ember_interp_embedded_module_load", err);
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_set_auto_load(
    handle: *mut EmbeddedInterpreter,
    enabled: c_int,
) {
    shielded("ember_interp_set_auto_load", || {
        deref("ember_interp_set_auto_load", handle).set_auto_load(enabled != 0);
    })
}

unsafe fn embed_ptr_raw<T: Element>(
    what: &'static str,
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const T,
    num_dims: usize,
    dim_sizes: *const usize,
) {
    shielded(what, || {
        let interp = deref(what, handle);
        let module = text(what, module);
        let attr = text(what, attr);
        if ptr.is_null() || (num_dims > 0 && dim_sizes.is_null()) {
            tracing::error!(call = what, "null buffer argument");
            process::abort();
        }
        let dims: &[usize] = if num_dims == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(dim_sizes, num_dims)
        };
        if let Err(err) = interp.embed_ptr(module, attr, ptr, dims) {
            fatal(what, err);
        }
    })
}

unsafe fn embed_ptr_scalar_raw<T: Element>(
    what: &'static str,
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const T,
) {
    embed_ptr_raw(what, handle, module, attr, ptr, 1, [1usize].as_ptr())
}

unsafe fn embed_value_raw<T: Element>(
    what: &'static str,
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    value: T,
) {
    shielded(what, || {
        let interp = deref(what, handle);
        let module = text(what, module);
        let attr = text(what, attr);
        if let Err(err) = interp.embed_value(module, attr, value) {
            fatal(what, err);
        }
    })
}

unsafe fn embed_value_func_raw<T: Element>(
    what: &'static str,
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    func: Option<extern "C" fn() -> T>,
) {
    shielded(what, || {
        let interp = deref(what, handle);
        let module = text(what, module);
        let attr = text(what, attr);
        let Some(func) = func else {
            tracing::error!(call = what, "null function pointer");
            process::abort();
        };
        if let Err(err) = interp.embed_value_func(module, attr, func) {
            fatal(what, err);
        }
    })
}

unsafe fn embed_value_case_raw<T: Element>(
    what: &'static str,
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    case_key: *const c_char,
    func: Option<extern "C" fn(*const c_char) -> T>,
) {
    shielded(what, || {
        let interp = deref(what, handle);
        let module = text(what, module);
        let attr = text(what, attr);
        let case_key = text(what, case_key);
        let Some(func) = func else {
            tracing::error!(call = what, "null function pointer");
            process::abort();
        };
        if let Err(err) = interp.embed_value_case(module, attr, case_key, func) {
            fatal(what, err);
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_double_ptr(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const f64,
    num_dims: usize,
    dim_sizes: *const usize,
) {
    embed_ptr_raw(
        "ember_interp_embed_double_ptr",
        handle,
        module,
        attr,
        ptr,
        num_dims,
        dim_sizes,
    )
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_float_ptr(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const f32,
    num_dims: usize,
    dim_sizes: *const usize,
) {
    embed_ptr_raw(
        "ember_interp_embed_float_ptr",
        handle,
        module,
        attr,
        ptr,
        num_dims,
        dim_sizes,
    )
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_int32_ptr(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const i32,
    num_dims: usize,
    dim_sizes: *const usize,
) {
    embed_ptr_raw(
        "ember_interp_embed_int32_ptr",
        handle,
        module,
        attr,
        ptr,
        num_dims,
        dim_sizes,
    )
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_double_ptr_scalar(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const f64,
) {
    embed_ptr_scalar_raw("ember_interp_embed_double_ptr_scalar", handle, module, attr, ptr)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_float_ptr_scalar(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const f32,
) {
    embed_ptr_scalar_raw("ember_interp_embed_float_ptr_scalar", handle, module, attr, ptr)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_int32_ptr_scalar(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    ptr: *const i32,
) {
    embed_ptr_scalar_raw("ember_interp_embed_int32_ptr_scalar", handle, module, attr, ptr)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_double_value(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    value: f64,
) {
    embed_value_raw("ember_interp_embed_double_value", handle, module, attr, value)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_float_value(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    value: f32,
) {
    embed_value_raw("ember_interp_embed_float_value", handle, module, attr, value)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_int32_value(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    value: i32,
) {
    embed_value_raw("ember_interp_embed_int32_value", handle, module, attr, value)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_double_value_func(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    func: Option<extern "C" fn() -> f64>,
) {
    embed_value_func_raw("ember_interp_embed_double_value_func", handle, module, attr, func)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_float_value_func(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    func: Option<extern "C" fn() -> f32>,
) {
    embed_value_func_raw("ember_interp_embed_float_value_func", handle, module, attr, func)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_int32_value_func(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    func: Option<extern "C" fn() -> i32>,
) {
    embed_value_func_raw("ember_interp_embed_int32_value_func", handle, module, attr, func)
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_double_value_case(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    case_key: *const c_char,
    func: Option<extern "C" fn(*const c_char) -> f64>,
) {
    embed_value_case_raw(
        "ember_interp_embed_double_value_case",
        handle,
        module,
        attr,
        case_key,
        func,
    )
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_float_value_case(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    case_key: *const c_char,
    func: Option<extern "C" fn(*const c_char) -> f32>,
) {
    embed_value_case_raw(
        "ember_interp_embed_float_value_case",
        handle,
        module,
        attr,
        case_key,
        func,
    )
}

#[no_mangle]
pub unsafe extern "C" fn ember_interp_embed_int32_value_case(
    handle: *mut EmbeddedInterpreter,
    module: *const c_char,
    attr: *const c_char,
    case_key: *const c_char,
    func: Option<extern "C" fn(*const c_char) -> i32>,
) {
    embed_value_case_raw(
        "ember_interp_embed_int32_value_case",
        handle,
        module,
        attr,
        case_key,
        func,
    )
}
