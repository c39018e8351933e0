//! C-compatible FFI for aggregating Jacobians from other languages.
//!
//! All functions are `#[no_mangle] extern "C"`.
//!
//! Memory convention:
//!   - Caller allocates flat row-major arrays and passes pointers + lengths.
//!   - Opaque handles (`*mut JdAggregatorHandle`) are created by Rust and
//!     freed by Rust via `jd_aggregator_free`.
//!   - Errors: functions return 0 on success, non-zero on failure; the
//!     message is kept in a thread-local and read with `jd_last_error`.

use crate::aggregation::{Aggregator, WeightedAggregator};
use crate::types::JdError;
use crate::weighting::{
    DualProjWeighting, MeanWeighting, MgdaWeighting, SumWeighting, UpgradWeighting, Weighting,
};
use ndarray::ArrayView2;
use std::cell::RefCell;
use std::ptr;
use std::slice;

// ─────────────────────────────────────────────────────────────
//  Thread-local error message
// ─────────────────────────────────────────────────────────────

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg.into()));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Error codes returned across the boundary.
pub const JD_OK: i32 = 0;
pub const JD_ERR_NULL_POINTER: i32 = 1;
pub const JD_ERR_EMPTY_JACOBIAN: i32 = 2;
pub const JD_ERR_SHAPE: i32 = 3;
pub const JD_ERR_OTHER: i32 = 4;

fn error_code(err: &JdError) -> i32 {
    match err {
        JdError::EmptyJacobian => JD_ERR_EMPTY_JACOBIAN,
        JdError::ShapeMismatch(_) | JdError::InconsistentShape { .. } => JD_ERR_SHAPE,
        _ => JD_ERR_OTHER,
    }
}

/// Copy the last error message (UTF-8, not NUL-terminated) into `buf`.
///
/// Returns the number of bytes written, 0 if there is no error, or -1 if
/// `buf` is null.
///
/// # Safety
/// `buf` must be valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn jd_last_error(buf: *mut u8, len: usize) -> i32 {
    if buf.is_null() {
        return -1;
    }
    LAST_ERROR.with(|e| match e.borrow().as_ref() {
        Some(msg) => {
            let n = msg.len().min(len);
            ptr::copy_nonoverlapping(msg.as_ptr(), buf, n);
            n as i32
        }
        None => 0,
    })
}

// ─────────────────────────────────────────────────────────────
//  Aggregator handle
// ─────────────────────────────────────────────────────────────

/// Owns one aggregator selected by kind.
pub struct JdAggregatorHandle {
    pub aggregator: WeightedAggregator<Box<dyn Weighting>>,
}

pub const JD_KIND_MEAN: u32 = 0;
pub const JD_KIND_SUM: u32 = 1;
pub const JD_KIND_MGDA: u32 = 2;
pub const JD_KIND_UPGRAD: u32 = 3;
pub const JD_KIND_DUALPROJ: u32 = 4;

fn weighting_for(kind: u32) -> Option<Box<dyn Weighting>> {
    let weighting: Box<dyn Weighting> = match kind {
        JD_KIND_MEAN => Box::new(MeanWeighting),
        JD_KIND_SUM => Box::new(SumWeighting),
        JD_KIND_MGDA => Box::new(MgdaWeighting::default()),
        JD_KIND_UPGRAD => Box::new(UpgradWeighting::default()),
        JD_KIND_DUALPROJ => Box::new(DualProjWeighting::default()),
        _ => return None,
    };
    Some(weighting)
}

/// Create an aggregator.  Returns null (and sets the last error) for an
/// unknown `kind`.
#[no_mangle]
pub extern "C" fn jd_aggregator_create(kind: u32) -> *mut JdAggregatorHandle {
    match weighting_for(kind) {
        Some(weighting) => {
            clear_last_error();
            Box::into_raw(Box::new(JdAggregatorHandle {
                aggregator: WeightedAggregator::new(weighting),
            }))
        }
        None => {
            set_last_error(format!("unknown aggregator kind {kind}"));
            ptr::null_mut()
        }
    }
}

/// Free a handle.
///
/// # Safety
/// `handle` must be null or a pointer returned by `jd_aggregator_create`.
#[no_mangle]
pub unsafe extern "C" fn jd_aggregator_free(handle: *mut JdAggregatorHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

// ─────────────────────────────────────────────────────────────
//  Aggregate
// ─────────────────────────────────────────────────────────────

/// Aggregate a row-major `rows × cols` Jacobian into `out` (length `cols`).
///
/// Returns 0 on success, non-zero on error.
///
/// # Safety
/// `jacobian` must be valid for `rows * cols` reads and `out` for `cols`
/// writes.
#[no_mangle]
pub unsafe extern "C" fn jd_aggregate(
    handle: *const JdAggregatorHandle,
    jacobian: *const f64,
    rows: usize,
    cols: usize,
    out: *mut f64,
) -> i32 {
    let Some(len) = rows.checked_mul(cols) else {
        set_last_error(format!("jacobian of {rows} x {cols} entries overflows usize"));
        return JD_ERR_SHAPE;
    };
    if handle.is_null() || out.is_null() || (jacobian.is_null() && len > 0) {
        set_last_error("null pointer passed to jd_aggregate");
        return JD_ERR_NULL_POINTER;
    }
    let h = &*handle;

    let data: &[f64] = if len == 0 {
        &[]
    } else {
        slice::from_raw_parts(jacobian, len)
    };
    let matrix = match ArrayView2::from_shape((rows, cols), data) {
        Ok(m) => m,
        Err(e) => {
            set_last_error(e.to_string());
            return JD_ERR_SHAPE;
        }
    };

    match h.aggregator.reduce(matrix) {
        Ok(result) => {
            let out = slice::from_raw_parts_mut(out, cols);
            for (dst, &v) in out.iter_mut().zip(result.iter()) {
                *dst = v;
            }
            clear_last_error();
            JD_OK
        }
        Err(e) => {
            let code = error_code(&e);
            set_last_error(e.to_string());
            code
        }
    }
}
