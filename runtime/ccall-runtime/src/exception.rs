//!
//! Last-Error Storage for C Entry Points
//!
//! Generated code calls the `ccall_*` entry points through the C ABI,
//! where a `Result` cannot cross. Failing entry points return null and
//! park the error in thread-local storage; the caller checks with
//! `ccall_error_check` and raises it through the managed runtime.
//!

use std::cell::RefCell;

use crate::errors::InteropError;

thread_local! {
    static LAST_ERROR: RefCell<Option<InteropError>> = const { RefCell::new(None) };
}

/// Store `err` as the current thread's pending error, replacing any older one.
pub fn set_last_error(err: InteropError) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
}

/// Take the current thread's pending error, leaving none behind.
pub fn take_last_error() -> Option<InteropError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Check if there's a pending error
#[unsafe(no_mangle)]
pub extern "C" fn ccall_error_check() -> i64 {
    LAST_ERROR.with(|slot| if slot.borrow().is_some() { 1 } else { 0 })
}

/// Drop the pending error, if any
#[unsafe(no_mangle)]
pub extern "C" fn ccall_error_clear() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_take_clear() {
        ccall_error_clear();
        assert_eq!(ccall_error_check(), 0);

        set_last_error(InteropError::InvalidName("first".to_string()));
        set_last_error(InteropError::InvalidName("second".to_string()));
        assert_eq!(ccall_error_check(), 1);

        let err = take_last_error().unwrap();
        assert!(err.to_string().contains("second"));
        assert_eq!(ccall_error_check(), 0);
        assert!(take_last_error().is_none());

        set_last_error(InteropError::InvalidName("third".to_string()));
        ccall_error_clear();
        assert!(take_last_error().is_none());
    }

    #[test]
    fn test_errors_are_per_thread() {
        set_last_error(InteropError::InvalidName("main".to_string()));

        let other = std::thread::spawn(|| ccall_error_check()).join().unwrap();
        assert_eq!(other, 0);

        assert!(take_last_error().is_some());
    }
}
