//! Native value publication
//!
//! Installs zero-argument accessors on embedded modules: shaped non-owning
//! views over native pointers, captured scalar values, and live native
//! callbacks. Accessors are plain script functions; calling one from script
//! code reads the native side at that moment.
//!
//! Callers must already hold the execution lock when publishing from a
//! worker thread; the publisher itself takes no lock.

use crate::error::{Result, ScriptError};
use crate::fpe::FpeGuard;
use crate::interp::EmbeddedInterpreter;
use rquickjs::function::Rest;
use rquickjs::{Array, Ctx, Exception, Function, Object, Value};
use std::ffi::{c_char, CString};

mod sealed {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for f32 {}
    impl Sealed for i32 {}
}

/// Scalar element kinds that can cross the native/script boundary.
pub trait Element: sealed::Sealed + Copy + Send + 'static {
    /// Type tag reported by buffer views.
    const KIND: &'static str;

    /// Reads element `index` counting from `addr`.
    ///
    /// # Safety
    /// `addr` must point to at least `index + 1` elements of `Self` that
    /// remain valid for the duration of the read.
    unsafe fn read(addr: usize, index: usize) -> Self;

    fn to_js<'js>(ctx: &Ctx<'js>, value: Self) -> rquickjs::Result<Value<'js>>;

    /// Runtime-native typed array holding `data`.
    fn typed_array<'js>(ctx: Ctx<'js>, data: Vec<Self>) -> rquickjs::Result<Value<'js>>;
}

macro_rules! element {
    ($ty:ty, $kind:literal) => {
        impl Element for $ty {
            const KIND: &'static str = $kind;

            unsafe fn read(addr: usize, index: usize) -> Self {
                std::ptr::read((addr as *const $ty).add(index))
            }

            fn to_js<'js>(ctx: &Ctx<'js>, value: Self) -> rquickjs::Result<Value<'js>> {
                use rquickjs::IntoJs;
                value.into_js(ctx)
            }

            fn typed_array<'js>(ctx: Ctx<'js>, data: Vec<Self>) -> rquickjs::Result<Value<'js>> {
                use rquickjs::IntoJs;
                rquickjs::TypedArray::new(ctx.clone(), data)?.into_js(&ctx)
            }
        }
    };
}

element!(f64, "float64");
element!(f32, "float32");
element!(i32, "int32");

/// What an installed accessor does on each call.
enum Accessor<T: Element> {
    /// Fresh non-owning view over native memory.
    Ptr { addr: usize, dims: Vec<usize> },
    /// Copy captured at publish time.
    Value(T),
    /// Native callback invoked per call.
    ValueFunc(extern "C" fn() -> T),
    /// Keyed native callback invoked per call with a fixed key.
    ValueCase {
        func: extern "C" fn(*const c_char) -> T,
        key: CString,
    },
}

/// Column-major flat offset of `indices` into an array shaped `dims`.
/// A single index addresses the flat memory order regardless of shape.
fn column_major_offset(dims: &[usize], indices: &[i32]) -> Option<usize> {
    if indices.len() == 1 && dims.len() != 1 {
        let index = usize::try_from(indices[0]).ok()?;
        let total: usize = dims.iter().product();
        return (index < total).then_some(index);
    }
    if indices.len() != dims.len() {
        return None;
    }
    let mut offset = 0usize;
    let mut stride = 1usize;
    for (index, dim) in indices.iter().zip(dims) {
        let index = usize::try_from(*index).ok()?;
        if index >= *dim {
            return None;
        }
        offset += index * stride;
        stride *= dim;
    }
    Some(offset)
}

/// Builds one view object over `addr`. Every element access reads through
/// the pointer, so native mutations are visible on the next call.
fn build_view<'js, T: Element>(
    ctx: Ctx<'js>,
    addr: usize,
    dims: &[usize],
) -> rquickjs::Result<Object<'js>> {
    let total: usize = dims.iter().product();
    let view = Object::new(ctx.clone())?;
    view.set("kind", T::KIND)?;
    view.set("order", "F")?;
    view.set("shape", dims.iter().map(|d| *d as i32).collect::<Vec<i32>>())?;
    view.set("length", total as i32)?;

    let get_dims = dims.to_vec();
    view.set(
        "get",
        Function::new(
            ctx.clone(),
            move |cx: Ctx, indices: Rest<i32>| -> rquickjs::Result<Value> {
                match column_major_offset(&get_dims, &indices.0) {
                    Some(offset) => T::to_js(&cx, unsafe { T::read(addr, offset) }),
                    None => Err(Exception::throw_message(&cx, "buffer view index out of range")),
                }
            },
        )?,
    )?;

    view.set(
        "typed",
        Function::new(ctx.clone(), move |cx: Ctx| -> rquickjs::Result<Value> {
            let data: Vec<T> = (0..total).map(|i| unsafe { T::read(addr, i) }).collect();
            T::typed_array(cx, data)
        })?,
    )?;

    view.set(
        "toArray",
        Function::new(ctx.clone(), move |cx: Ctx| -> rquickjs::Result<Array> {
            let list = Array::new(cx.clone())?;
            for i in 0..total {
                list.set(i, T::to_js(&cx, unsafe { T::read(addr, i) })?)?;
            }
            Ok(list)
        })?,
    )?;

    Ok(view)
}

impl EmbeddedInterpreter {
    /// Publishes `attr` on an embedded module as an accessor returning a
    /// fresh view over `ptr` (shape `dims`, column-major) on every call.
    ///
    /// # Safety
    /// `ptr` must stay valid with the given extents for as long as the
    /// embedded module can invoke the accessor. The view neither copies nor
    /// frees the memory; lifetime is entirely the caller's responsibility.
    pub unsafe fn embed_ptr<T: Element>(
        &self,
        module: &str,
        attr: &str,
        ptr: *const T,
        dims: &[usize],
    ) -> Result<()> {
        self.install::<T>(
            module,
            attr,
            Accessor::Ptr {
                addr: ptr as usize,
                dims: dims.to_vec(),
            },
        )
    }

    /// One-dimensional, size-1 convenience form of [`Self::embed_ptr`].
    ///
    /// # Safety
    /// Same contract as [`Self::embed_ptr`] with a single-element extent.
    pub unsafe fn embed_ptr_scalar<T: Element>(
        &self,
        module: &str,
        attr: &str,
        ptr: *const T,
    ) -> Result<()> {
        self.embed_ptr(module, attr, ptr, &[1])
    }

    /// Publishes a copy of `value` captured now; later mutation of the
    /// native original does not propagate.
    pub fn embed_value<T: Element>(&self, module: &str, attr: &str, value: T) -> Result<()> {
        self.install::<T>(module, attr, Accessor::Value(value))
    }

    /// Publishes a native callback; each accessor call re-invokes it, so
    /// the scripted side always sees the current value.
    pub fn embed_value_func<T: Element>(
        &self,
        module: &str,
        attr: &str,
        func: extern "C" fn() -> T,
    ) -> Result<()> {
        self.install::<T>(module, attr, Accessor::ValueFunc(func))
    }

    /// Publishes a keyed native callback: each accessor call invokes `func`
    /// with the fixed `case_key`. Several attributes can fan out over one
    /// dispatch-by-string native function this way.
    pub fn embed_value_case<T: Element>(
        &self,
        module: &str,
        attr: &str,
        case_key: &str,
        func: extern "C" fn(*const c_char) -> T,
    ) -> Result<()> {
        let key = CString::new(case_key).map_err(|_| ScriptError::Eval {
            context: attr.to_string(),
            detail: format!("case key '{case_key}' contains an interior NUL byte"),
        })?;
        self.install::<T>(module, attr, Accessor::ValueCase { func, key })
    }

    /// Single installation path for all accessor variants. Re-publishing an
    /// attribute name replaces the previous accessor.
    fn install<T: Element>(&self, module: &str, attr: &str, accessor: Accessor<T>) -> Result<()> {
        let mut guard = self.state();
        let st = &mut *guard;
        self.check_embedded_loaded(st, module)?;
        let js = st.js.as_ref().ok_or(ScriptError::NotInitialized)?;
        let target = match st.embedded.get(module) {
            Some(entry) => entry.clone(),
            None => {
                return Err(ScriptError::EmbeddedModuleMissing {
                    name: module.to_string(),
                })
            }
        };

        let _fpe = FpeGuard::hold();
        js.context.with(|ctx| -> Result<()> {
            let namespace = target.restore(&ctx)?;
            let installed = match accessor {
                Accessor::Ptr { addr, dims } => Function::new(
                    ctx.clone(),
                    move |cx: Ctx| -> rquickjs::Result<Object> { build_view::<T>(cx, addr, &dims) },
                )?,
                Accessor::Value(value) => Function::new(
                    ctx.clone(),
                    move |cx: Ctx| -> rquickjs::Result<Value> { T::to_js(&cx, value) },
                )?,
                Accessor::ValueFunc(func) => Function::new(
                    ctx.clone(),
                    move |cx: Ctx| -> rquickjs::Result<Value> { T::to_js(&cx, func()) },
                )?,
                Accessor::ValueCase { func, key } => Function::new(
                    ctx.clone(),
                    move |cx: Ctx| -> rquickjs::Result<Value> { T::to_js(&cx, func(key.as_ptr())) },
                )?,
            };
            namespace.set(attr, installed)?;
            Ok(())
        })?;
        tracing::debug!(module, attr, kind = T::KIND, "attribute published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::sync::atomic::{AtomicI32, Ordering};

    const SINK_MODULE: &str = "// receives published attributes\n";

    fn host_with_module(name: &str) -> (EmbeddedInterpreter, tempfile::TempDir) {
        let interp = EmbeddedInterpreter::new();
        interp.initialize().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{name}.js")), SINK_MODULE).unwrap();
        interp.add_to_scope(dir.path()).unwrap();
        (interp, dir)
    }

    #[test]
    fn buffer_view_tracks_native_mutation() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        let mut data = vec![1.0f64, 2.0, 3.0, 4.0, 5.0];
        let ptr = data.as_mut_ptr() as *const f64;
        unsafe {
            interp
                .embed_ptr("demo", "demoData", ptr, &[data.len()])
                .unwrap();
        }

        let first: Vec<f64> = interp.eval("demo.demoData().toArray()").unwrap();
        assert_eq!(first, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        data[2] = 9.0;
        let second: Vec<f64> = interp.eval("demo.demoData().toArray()").unwrap();
        assert_eq!(second, vec![1.0, 2.0, 9.0, 4.0, 5.0]);
    }

    #[test]
    fn buffer_view_reports_shape_and_kind() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        let data = vec![0.0f64; 6];
        unsafe {
            interp.embed_ptr("demo", "grid", data.as_ptr(), &[2, 3]).unwrap();
        }
        assert_eq!(
            interp.eval::<Vec<i32>>("demo.grid().shape").unwrap(),
            vec![2, 3]
        );
        assert_eq!(interp.eval::<String>("demo.grid().order").unwrap(), "F");
        assert_eq!(
            interp.eval::<String>("demo.grid().kind").unwrap(),
            "float64"
        );
        assert_eq!(interp.eval::<i32>("demo.grid().length").unwrap(), 6);
    }

    #[test]
    fn element_get_uses_column_major_strides() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        // Memory order 1..6 viewed as a 2x3 column-major matrix:
        // element (1, 2) sits at offset 1 + 2*2 = 5.
        let data: Vec<f64> = (1..=6).map(f64::from).collect();
        unsafe {
            interp.embed_ptr("demo", "m", data.as_ptr(), &[2, 3]).unwrap();
        }
        assert_eq!(interp.eval::<f64>("demo.m().get(1, 2)").unwrap(), 6.0);
        assert_eq!(interp.eval::<f64>("demo.m().get(0, 1)").unwrap(), 3.0);
        // Flat indexing addresses memory order.
        assert_eq!(interp.eval::<f64>("demo.m().get(4)").unwrap(), 5.0);
        assert!(interp.eval::<f64>("demo.m().get(2, 0)").is_err());
    }

    #[test]
    fn typed_array_snapshots_current_contents() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        let mut data = vec![1i32, 2, 3];
        let ptr = data.as_mut_ptr() as *const i32;
        unsafe {
            interp.embed_ptr("demo", "ints", ptr, &[3]).unwrap();
        }
        assert_eq!(
            interp.eval::<i32>("demo.ints().typed().length").unwrap(),
            3
        );
        data[0] = 11;
        assert_eq!(interp.eval::<i32>("demo.ints().typed()[0]").unwrap(), 11);
    }

    #[test]
    fn scalar_pointer_is_a_one_element_view() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        let mut value = 2.5f32;
        let ptr = &mut value as *mut f32 as *const f32;
        unsafe {
            interp.embed_ptr_scalar("demo", "dt", ptr).unwrap();
        }
        assert_eq!(
            interp.eval::<Vec<i32>>("demo.dt().shape").unwrap(),
            vec![1]
        );
        assert_eq!(interp.eval::<f32>("demo.dt().get(0)").unwrap(), 2.5);
        value = 0.75;
        assert_eq!(interp.eval::<f32>("demo.dt().get(0)").unwrap(), 0.75);
    }

    static CURRENT: AtomicI32 = AtomicI32::new(10);

    extern "C" fn current_value() -> i32 {
        CURRENT.load(Ordering::SeqCst)
    }

    #[test]
    fn captured_value_and_live_callback_are_distinguishable() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        CURRENT.store(10, Ordering::SeqCst);
        interp.embed_value("demo", "captured", 10i32).unwrap();
        interp.embed_value_func("demo", "live", current_value).unwrap();

        CURRENT.store(42, Ordering::SeqCst);
        assert_eq!(interp.eval::<i32>("demo.captured()").unwrap(), 10);
        assert_eq!(interp.eval::<i32>("demo.live()").unwrap(), 42);

        CURRENT.store(7, Ordering::SeqCst);
        assert_eq!(interp.eval::<i32>("demo.captured()").unwrap(), 10);
        assert_eq!(interp.eval::<i32>("demo.live()").unwrap(), 7);
    }

    extern "C" fn keyed_lookup(key: *const c_char) -> f64 {
        let key = unsafe { CStr::from_ptr(key) }.to_str().unwrap_or("");
        match key {
            "dt" => 0.5,
            "cfl" => 0.9,
            _ => -1.0,
        }
    }

    #[test]
    fn case_accessors_share_one_native_dispatch() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        interp.embed_value_case("demo", "dt", "dt", keyed_lookup).unwrap();
        interp.embed_value_case("demo", "cfl", "cfl", keyed_lookup).unwrap();
        interp
            .embed_value_case("demo", "other", "unknown", keyed_lookup)
            .unwrap();

        assert_eq!(interp.eval::<f64>("demo.dt()").unwrap(), 0.5);
        assert_eq!(interp.eval::<f64>("demo.cfl()").unwrap(), 0.9);
        assert_eq!(interp.eval::<f64>("demo.other()").unwrap(), -1.0);
    }

    #[test]
    fn publishing_into_an_unregistered_module_fails_without_auto_load() {
        let (interp, _dir) = host_with_module("demo");

        match interp.embed_value("demo", "x", 1.0f64) {
            Err(ScriptError::EmbeddedModuleMissing { name }) => assert_eq!(name, "demo"),
            other => panic!("expected EmbeddedModuleMissing, got {other:?}"),
        }
        assert!(!interp.is_embedded_module_loaded("demo"));

        interp.set_auto_load(true);
        interp.embed_value("demo", "x", 1.0f64).unwrap();
        assert!(interp.is_embedded_module_loaded("demo"));
        assert_eq!(interp.eval::<f64>("demo.x()").unwrap(), 1.0);
    }

    #[test]
    fn republishing_replaces_the_accessor() {
        let (interp, _dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();

        interp.embed_value("demo", "n", 1i32).unwrap();
        assert_eq!(interp.eval::<i32>("demo.n()").unwrap(), 1);
        interp.embed_value("demo", "n", 2i32).unwrap();
        assert_eq!(interp.eval::<i32>("demo.n()").unwrap(), 2);
    }

    #[test]
    fn published_attributes_are_reachable_from_loaded_modules() {
        let (interp, dir) = host_with_module("demo");
        interp.embedded_module_load("demo").unwrap();
        interp.embed_value("demo", "setting", 3i32).unwrap();

        std::fs::write(
            dir.path().join("consumer.js"),
            "exports.main = function() { globalThis.seen = demo.setting(); };\n",
        )
        .unwrap();
        interp.module_load("consumer").unwrap();
        interp.module_call("consumer", "main").unwrap();
        assert_eq!(interp.eval::<i32>("seen").unwrap(), 3);
    }
}
