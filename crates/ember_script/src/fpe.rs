//! Floating-point environment guard
//!
//! Interpreter start-up and numeric extensions loaded by scripts can alter
//! the host's floating-point trap masks. Every call that crosses into the
//! interpreter is bracketed by an [`FpeGuard`] so the native environment is
//! restored no matter how the call returns.

/// Saves the floating-point environment on construction and restores it on
/// drop. Restoration also happens during unwinding.
pub struct FpeGuard {
    #[cfg(unix)]
    saved: libc::fenv_t,
}

#[cfg(unix)]
impl FpeGuard {
    pub fn hold() -> Self {
        let mut env = std::mem::MaybeUninit::<libc::fenv_t>::uninit();
        // feholdexcept also clears exception flags and disables traps for
        // the guarded region, matching feholdexcept(3) semantics.
        let saved = unsafe {
            libc::feholdexcept(env.as_mut_ptr());
            env.assume_init()
        };
        Self { saved }
    }
}

#[cfg(unix)]
impl Drop for FpeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::fesetenv(&self.saved);
        }
    }
}

#[cfg(not(unix))]
impl FpeGuard {
    pub fn hold() -> Self {
        Self {}
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn restores_exception_flags_on_drop() {
        unsafe {
            libc::feclearexcept(libc::FE_ALL_EXCEPT);
        }

        {
            let _guard = FpeGuard::hold();
            unsafe {
                libc::feraiseexcept(libc::FE_DIVBYZERO);
                assert_ne!(libc::fetestexcept(libc::FE_DIVBYZERO), 0);
            }
        }

        // The flag raised inside the guarded region must not leak out.
        let leaked = unsafe { libc::fetestexcept(libc::FE_DIVBYZERO) };
        assert_eq!(leaked, 0);
    }

    #[test]
    fn nested_guards_unwind_in_order() {
        let outer = FpeGuard::hold();
        {
            let _inner = FpeGuard::hold();
            unsafe {
                libc::feraiseexcept(libc::FE_INEXACT);
            }
        }
        assert_eq!(unsafe { libc::fetestexcept(libc::FE_INEXACT) }, 0);
        drop(outer);
    }
}
