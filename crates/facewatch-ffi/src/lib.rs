//! facewatch: C bindings for the face identity database.
//!
//! The host owns an opaque `FacewatchHandle` and passes raw interleaved
//! 8-bit frames (BGR, BGRA or grayscale, row-major, no padding) for
//! identification. See `include/facewatch.h`.
//!
//! # Safety
//!
//! Every entry point runs inside `catch_unwind`; a panic unwinding across the
//! `extern "C"` boundary is undefined behavior. Panics are reported as the
//! function's failure value.

#![warn(unsafe_op_in_unsafe_fn)]

use facewatch_core::{
    Config, Database, DatabaseError, FaceBackend, MatchResult, WatchStatus,
};
use image::{DynamicImage, GrayImage, RgbImage};
use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::time::Duration;

use libc::{c_char, c_float, c_int, c_uint};

pub const FACEWATCH_OK: c_int = 0;
pub const FACEWATCH_INVALID_ARGUMENT: c_int = -1;
pub const FACEWATCH_NOT_AVAILABLE: c_int = -2;

/// Returned by `facewatch_enable_hot_reload` when the directory cannot be
/// observed; the loaded snapshot keeps serving.
pub const FACEWATCH_WATCH_DORMANT: c_int = 1;

const ERROR_NAME: &str = "error";

/// Opaque engine handle.
pub struct FacewatchHandle {
    db: Database,
    config: Config,
}

impl FacewatchHandle {
    fn new(backend: FaceBackend, config: Config) -> Self {
        Self {
            db: Database::new(backend),
            config,
        }
    }
}

/// Identification result. `name` is owned by the library; release it with
/// `facewatch_free_match`.
#[repr(C)]
pub struct FacewatchMatch {
    pub name: *mut c_char,
    pub score: c_float,
    pub status: c_int,
}

impl FacewatchMatch {
    fn new(name: &str, score: f32, status: c_int) -> Self {
        let name = CString::new(name.replace('\0', ""))
            .unwrap_or_default()
            .into_raw();
        Self {
            name,
            score,
            status,
        }
    }

    fn from_result(result: &MatchResult) -> Self {
        Self::new(&result.name, result.score, FACEWATCH_OK)
    }

    fn invalid() -> Self {
        Self::new(ERROR_NAME, 0.0, FACEWATCH_INVALID_ARGUMENT)
    }

    fn unavailable() -> Self {
        Self::new(facewatch_core::UNKNOWN, 0.0, FACEWATCH_NOT_AVAILABLE)
    }
}

fn guard<T>(fallback: impl FnOnce() -> T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!("panic caught at the C boundary");
        fallback()
    })
}

/// # Safety
///
/// `s` must be null or a valid NUL-terminated string.
unsafe fn str_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

/// # Safety
///
/// `h` must be null or a pointer returned by a `facewatch_create*` function
/// that has not been destroyed.
unsafe fn handle<'a>(h: *const FacewatchHandle) -> Option<&'a FacewatchHandle> {
    // SAFETY: per the caller contract.
    unsafe { h.as_ref() }
}

/// Interpret `rows × cols × channels` interleaved bytes as an image. Three
/// channels are BGR, four are BGRA, one is grayscale.
fn image_from_raw(data: &[u8], rows: usize, cols: usize, channels: usize) -> Option<DynamicImage> {
    if rows == 0 || cols == 0 {
        return None;
    }
    let expected = rows.checked_mul(cols)?.checked_mul(channels)?;
    if data.len() != expected {
        return None;
    }
    let (w, h) = (u32::try_from(cols).ok()?, u32::try_from(rows).ok()?);

    match channels {
        1 => GrayImage::from_raw(w, h, data.to_vec()).map(DynamicImage::ImageLuma8),
        3 | 4 => {
            let rgb = data
                .chunks_exact(channels)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect();
            RgbImage::from_raw(w, h, rgb).map(DynamicImage::ImageRgb8)
        }
        _ => None,
    }
}

fn create(config: Config, detector: &str, embedder: &str) -> *mut FacewatchHandle {
    match FaceBackend::onnx(detector, embedder, config.intra_threads) {
        Ok(backend) => Box::into_raw(Box::new(FacewatchHandle::new(backend, config))),
        Err(e) => {
            tracing::error!(error = %e, "cannot load face models");
            ptr::null_mut()
        }
    }
}

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`.
/// Calling it more than once has no effect.
#[no_mangle]
pub extern "C" fn facewatch_init_logging() {
    guard(|| (), || {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    })
}

/// Create an engine with models from `FACEWATCH_MODEL_DIR`. Returns NULL on
/// failure.
#[no_mangle]
pub extern "C" fn facewatch_create() -> *mut FacewatchHandle {
    guard(ptr::null_mut, || {
        let config = Config::from_env();
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "invalid configuration");
            return ptr::null_mut();
        }
        let (det, rec) = (config.detector_model_path(), config.embedder_model_path());
        create(config, &det, &rec)
    })
}

/// Create an engine with explicit model paths. Returns NULL on failure.
///
/// # Safety
///
/// Both arguments must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn facewatch_create_with_models(
    detector_path: *const c_char,
    embedder_path: *const c_char,
) -> *mut FacewatchHandle {
    guard(ptr::null_mut, || {
        // SAFETY: per the function contract.
        let (Some(det), Some(rec)) = (unsafe { str_arg(detector_path) }, unsafe {
            str_arg(embedder_path)
        }) else {
            tracing::error!("model paths must be non-null UTF-8");
            return ptr::null_mut();
        };
        create(Config::from_env(), det, rec)
    })
}

/// Load the database at `path`. Returns 0 on success, -1 on failure, -2
/// after shutdown.
///
/// # Safety
///
/// `h` must be a live handle; `path` a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn facewatch_load_db(h: *mut FacewatchHandle, path: *const c_char) -> c_int {
    guard(|| FACEWATCH_INVALID_ARGUMENT, || {
        // SAFETY: per the function contract.
        let (Some(h), Some(path)) = (unsafe { handle(h) }, unsafe { str_arg(path) }) else {
            return FACEWATCH_INVALID_ARGUMENT;
        };
        match h.db.load_initial(Path::new(path)) {
            Ok(_) => FACEWATCH_OK,
            Err(DatabaseError::NotAvailable) => FACEWATCH_NOT_AVAILABLE,
            Err(e) => {
                tracing::error!(path, error = %e, "cannot load identity database");
                FACEWATCH_INVALID_ARGUMENT
            }
        }
    })
}

/// Enable hot reload with a `debounce_secs` quiet period (0 uses
/// `FACEWATCH_DEBOUNCE_SECS`). Returns 0 when watching, 1 when the directory
/// cannot be observed, -1 when no database is loaded, -2 after shutdown.
///
/// # Safety
///
/// `h` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn facewatch_enable_hot_reload(
    h: *mut FacewatchHandle,
    debounce_secs: c_uint,
) -> c_int {
    guard(|| FACEWATCH_INVALID_ARGUMENT, || {
        // SAFETY: per the function contract.
        let Some(h) = (unsafe { handle(h) }) else {
            return FACEWATCH_INVALID_ARGUMENT;
        };
        let debounce = match debounce_secs {
            0 => h.config.debounce(),
            secs => Duration::from_secs(u64::from(secs)),
        };
        match h.db.start_watching(debounce) {
            Ok(WatchStatus::Active) => FACEWATCH_OK,
            Ok(WatchStatus::Dormant) => FACEWATCH_WATCH_DORMANT,
            Err(DatabaseError::NotAvailable) => FACEWATCH_NOT_AVAILABLE,
            Err(e) => {
                tracing::warn!(error = %e, "cannot enable hot reload");
                FACEWATCH_INVALID_ARGUMENT
            }
        }
    })
}

/// Disable hot reload; waits for the watcher thread.
///
/// # Safety
///
/// `h` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn facewatch_disable_hot_reload(h: *mut FacewatchHandle) {
    guard(|| (), || {
        // SAFETY: per the function contract.
        if let Some(h) = unsafe { handle(h) } {
            h.db.stop_watching();
        }
    })
}

/// Rebuild the database from disk now. Returns 0 on success, -1 on failure,
/// -2 after shutdown.
///
/// # Safety
///
/// `h` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn facewatch_reload(h: *mut FacewatchHandle) -> c_int {
    guard(|| FACEWATCH_INVALID_ARGUMENT, || {
        // SAFETY: per the function contract.
        let Some(h) = (unsafe { handle(h) }) else {
            return FACEWATCH_INVALID_ARGUMENT;
        };
        match h.db.reload_now() {
            Ok(_) => FACEWATCH_OK,
            Err(DatabaseError::NotAvailable) => FACEWATCH_NOT_AVAILABLE,
            Err(e) => {
                tracing::warn!(error = %e, "reload failed");
                FACEWATCH_INVALID_ARGUMENT
            }
        }
    })
}

/// Identify the most confident face in a frame.
///
/// `status` is 0 on success (`name` may be `"unknown"`), -1 for invalid
/// arguments (`name` is `"error"`), -2 when no database is loaded or the
/// engine is shut down.
///
/// # Safety
///
/// `h` must be a live handle; `data` must point to `rows * cols * channels`
/// readable bytes.
#[no_mangle]
pub unsafe extern "C" fn facewatch_identify(
    h: *mut FacewatchHandle,
    data: *const u8,
    rows: c_int,
    cols: c_int,
    channels: c_int,
    threshold: c_float,
) -> FacewatchMatch {
    guard(FacewatchMatch::invalid, || {
        // SAFETY: per the function contract.
        let Some(h) = (unsafe { handle(h) }) else {
            return FacewatchMatch::invalid();
        };
        // SAFETY: per the function contract.
        let Some(image) = (unsafe { frame(data, rows, cols, channels) }) else {
            return FacewatchMatch::invalid();
        };
        if !(-1.0..=1.0).contains(&threshold) {
            return FacewatchMatch::invalid();
        }

        match h.db.identify(&image, threshold) {
            Ok(result) => FacewatchMatch::from_result(&result),
            Err(e) => {
                tracing::debug!(error = %e, "identify unavailable");
                FacewatchMatch::unavailable()
            }
        }
    })
}

/// Number of faces in a frame, -1 on invalid arguments or failure, -2 after
/// shutdown.
///
/// # Safety
///
/// As for `facewatch_identify`.
#[no_mangle]
pub unsafe extern "C" fn facewatch_count_faces(
    h: *mut FacewatchHandle,
    data: *const u8,
    rows: c_int,
    cols: c_int,
    channels: c_int,
) -> c_int {
    guard(|| FACEWATCH_INVALID_ARGUMENT, || {
        // SAFETY: per the function contract.
        let (Some(h), Some(image)) = (unsafe { handle(h) }, unsafe {
            frame(data, rows, cols, channels)
        }) else {
            return FACEWATCH_INVALID_ARGUMENT;
        };
        match h.db.count_faces(&image) {
            Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
            Err(DatabaseError::NotAvailable) => FACEWATCH_NOT_AVAILABLE,
            Err(e) => {
                tracing::warn!(error = %e, "face count failed");
                FACEWATCH_INVALID_ARGUMENT
            }
        }
    })
}

/// # Safety
///
/// `data` must be null or point to `rows * cols * channels` readable bytes.
unsafe fn frame(data: *const u8, rows: c_int, cols: c_int, channels: c_int) -> Option<DynamicImage> {
    if data.is_null() {
        return None;
    }
    let rows = usize::try_from(rows).ok()?;
    let cols = usize::try_from(cols).ok()?;
    let channels = usize::try_from(channels).ok()?;
    let len = rows.checked_mul(cols)?.checked_mul(channels)?;
    // SAFETY: non-null and `len` bytes readable per the caller contract.
    let bytes = unsafe { std::slice::from_raw_parts(data, len) };
    image_from_raw(bytes, rows, cols, channels)
}

/// Release the name of a result and clear it. Safe to call twice.
///
/// # Safety
///
/// `m` must be null or point to a `FacewatchMatch` returned by this library.
#[no_mangle]
pub unsafe extern "C" fn facewatch_free_match(m: *mut FacewatchMatch) {
    guard(|| (), || {
        // SAFETY: per the function contract.
        let Some(m) = (unsafe { m.as_mut() }) else {
            return;
        };
        if !m.name.is_null() {
            // SAFETY: `name` came from `CString::into_raw` in this library.
            drop(unsafe { CString::from_raw(m.name) });
            m.name = ptr::null_mut();
        }
    })
}

/// Stop hot reload and release the database. Later calls report -2. The
/// handle itself stays valid until `facewatch_destroy`.
///
/// # Safety
///
/// `h` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn facewatch_shutdown(h: *mut FacewatchHandle) {
    guard(|| (), || {
        // SAFETY: per the function contract.
        if let Some(h) = unsafe { handle(h) } {
            h.db.shutdown();
        }
    })
}

/// Shut down and free the handle. Returns after the watcher thread exits.
///
/// # Safety
///
/// `h` must be null or a handle not yet destroyed; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn facewatch_destroy(h: *mut FacewatchHandle) {
    guard(|| (), || {
        if h.is_null() {
            return;
        }
        // SAFETY: `h` came from `Box::into_raw` and is destroyed once.
        drop(unsafe { Box::from_raw(h) });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{BackendError, Descriptor, FaceDetector, FaceEmbedder, FaceRegion};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// One face whenever the top-left pixel is not black; the descriptor is
    /// that pixel's colour.
    struct CornerPixel;

    impl FaceDetector for CornerPixel {
        fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>, BackendError> {
            let px = image.to_rgb8().get_pixel(0, 0).0;
            if px == [0, 0, 0] {
                return Ok(Vec::new());
            }
            Ok(vec![FaceRegion {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 0.9,
                landmarks: None,
            }])
        }
    }

    impl FaceEmbedder for CornerPixel {
        fn embed(&self, image: &DynamicImage, _face: &FaceRegion) -> Result<Descriptor, BackendError> {
            let px = image.to_rgb8().get_pixel(0, 0).0;
            Ok(Descriptor::new(px.map(f32::from).to_vec()))
        }
    }

    fn test_handle() -> *mut FacewatchHandle {
        let model = Arc::new(CornerPixel);
        let backend = FaceBackend::new(model.clone(), model);
        Box::into_raw(Box::new(FacewatchHandle::new(backend, Config::from_env())))
    }

    fn name_of(m: &FacewatchMatch) -> String {
        unsafe { CStr::from_ptr(m.name) }.to_string_lossy().into_owned()
    }

    fn bgr_frame(b: u8, g: u8, r: u8) -> Vec<u8> {
        [b, g, r].repeat(4 * 4)
    }

    #[test]
    fn test_bgr_is_converted_to_rgb() {
        let img = image_from_raw(&[1, 2, 3, 4, 5, 6], 1, 2, 3).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(img.get_pixel(1, 0).0, [6, 5, 4]);
    }

    #[test]
    fn test_bgra_and_gray() {
        let img = image_from_raw(&[1, 2, 3, 255], 1, 1, 4).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [3, 2, 1]);
        let gray = image_from_raw(&[7, 8], 2, 1, 1).unwrap();
        assert_eq!((gray.width(), gray.height()), (1, 2));
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(image_from_raw(&[0; 6], 1, 2, 2).is_none());
        assert!(image_from_raw(&[0; 5], 1, 2, 3).is_none());
        assert!(image_from_raw(&[], 0, 0, 3).is_none());
        assert!(unsafe { frame(ptr::null(), 4, 4, 3) }.is_none());
        assert!(unsafe { frame([0u8; 3].as_ptr(), -1, 1, 3) }.is_none());
    }

    #[test]
    fn test_null_handle_is_invalid() {
        let data = bgr_frame(10, 20, 30);
        let mut m = unsafe { facewatch_identify(ptr::null_mut(), data.as_ptr(), 4, 4, 3, 0.4) };
        assert_eq!(m.status, FACEWATCH_INVALID_ARGUMENT);
        assert_eq!(name_of(&m), "error");
        unsafe { facewatch_free_match(&mut m) };
        assert!(m.name.is_null());
        unsafe { facewatch_free_match(&mut m) };

        assert_eq!(unsafe { facewatch_load_db(ptr::null_mut(), CString::new("/tmp").unwrap().as_ptr()) }, -1);
        unsafe { facewatch_destroy(ptr::null_mut()) };
    }

    #[test]
    fn test_identify_lifecycle() {
        let dir = tempdir().unwrap();
        let alice = dir.path().join("alice");
        std::fs::create_dir(&alice).unwrap();
        RgbImage::from_pixel(4, 4, image::Rgb([200, 10, 10]))
            .save(alice.join("ref.png"))
            .unwrap();
        let root = CString::new(dir.path().to_str().unwrap()).unwrap();

        let h = test_handle();
        let data = bgr_frame(10, 10, 200);

        let mut m = unsafe { facewatch_identify(h, data.as_ptr(), 4, 4, 3, 0.4) };
        assert_eq!(m.status, FACEWATCH_NOT_AVAILABLE);
        unsafe { facewatch_free_match(&mut m) };

        assert_eq!(unsafe { facewatch_load_db(h, root.as_ptr()) }, FACEWATCH_OK);
        assert_eq!(unsafe { facewatch_enable_hot_reload(h, 1) }, FACEWATCH_OK);

        let mut m = unsafe { facewatch_identify(h, data.as_ptr(), 4, 4, 3, 0.4) };
        assert_eq!(m.status, FACEWATCH_OK);
        assert_eq!(name_of(&m), "alice");
        assert!((m.score - 1.0).abs() < 1e-5);
        unsafe { facewatch_free_match(&mut m) };

        let blank = bgr_frame(0, 0, 0);
        let mut m = unsafe { facewatch_identify(h, blank.as_ptr(), 4, 4, 3, 0.4) };
        assert_eq!(m.status, FACEWATCH_OK);
        assert_eq!(name_of(&m), "unknown");
        assert_eq!(m.score, 0.0);
        unsafe { facewatch_free_match(&mut m) };

        assert_eq!(unsafe { facewatch_count_faces(h, data.as_ptr(), 4, 4, 3) }, 1);
        assert_eq!(unsafe { facewatch_reload(h) }, FACEWATCH_OK);

        unsafe { facewatch_shutdown(h) };
        let mut m = unsafe { facewatch_identify(h, data.as_ptr(), 4, 4, 3, 0.4) };
        assert_eq!(m.status, FACEWATCH_NOT_AVAILABLE);
        unsafe { facewatch_free_match(&mut m) };
        assert_eq!(unsafe { facewatch_reload(h) }, FACEWATCH_NOT_AVAILABLE);
        assert_eq!(unsafe { facewatch_load_db(h, root.as_ptr()) }, FACEWATCH_NOT_AVAILABLE);
        assert_eq!(unsafe { facewatch_enable_hot_reload(h, 1) }, FACEWATCH_NOT_AVAILABLE);
        assert_eq!(
            unsafe { facewatch_count_faces(h, data.as_ptr(), 4, 4, 3) },
            FACEWATCH_NOT_AVAILABLE
        );

        unsafe { facewatch_destroy(h) };
    }

    #[test]
    fn test_threshold_out_of_range_is_invalid() {
        let h = test_handle();
        let data = bgr_frame(1, 2, 3);
        let mut m = unsafe { facewatch_identify(h, data.as_ptr(), 4, 4, 3, 1.5) };
        assert_eq!(m.status, FACEWATCH_INVALID_ARGUMENT);
        unsafe { facewatch_free_match(&mut m) };
        unsafe { facewatch_destroy(h) };
    }
}
