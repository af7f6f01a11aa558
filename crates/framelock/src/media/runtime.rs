//! Process-wide FFmpeg runtime setup.
//!
//! Registration runs exactly once per process no matter how many players
//! call in: it optionally extends the shared-library search path, runs
//! `ffmpeg::init`, clamps the native log level to errors, and routes the
//! native log stream into `tracing` under the `ffmpeg` target.

use std::env;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use tracing::{error, info, trace, warn};

static REGISTERED: OnceLock<()> = OnceLock::new();

/// Registers the FFmpeg runtime if this process has not done so yet.
/// Returns `true` only for the call that performed the registration.
///
/// `library_dir` is prepended to the dynamic-library search path before
/// anything touches FFmpeg, for installs that ship their own libav
/// binaries next to the executable.
pub fn ensure_registered(library_dir: Option<&Path>) -> bool {
    let mut first = false;
    REGISTERED.get_or_init(|| {
        first = true;
        register(library_dir);
    });
    if !first {
        trace!("ffmpeg runtime already registered");
    }
    first
}

fn register(library_dir: Option<&Path>) {
    if let Some(dir) = library_dir {
        extend_library_path(dir);
    }
    if let Err(err) = ffmpeg::init() {
        warn!(%err, "ffmpeg init reported an error");
    }
    ffmpeg::log::set_level(ffmpeg::log::Level::Error);
    unsafe { ffi::av_log_set_callback(Some(forward_av_log)) };
    info!(version = ffmpeg::util::version(), "ffmpeg runtime registered");
}

fn extend_library_path(dir: &Path) {
    #[cfg(all(windows, feature = "d3d11"))]
    {
        use windows::core::HSTRING;
        use windows::Win32::System::LibraryLoader::SetDllDirectoryW;

        if let Err(err) = unsafe { SetDllDirectoryW(&HSTRING::from(dir.as_os_str())) } {
            warn!(%err, "SetDllDirectoryW failed");
        }
    }

    const VAR: &str = if cfg!(windows) { "PATH" } else { "LD_LIBRARY_PATH" };
    let mut paths: Vec<PathBuf> = env::var_os(VAR)
        .map(|value| env::split_paths(&value).collect())
        .unwrap_or_default();
    paths.insert(0, dir.to_path_buf());
    match env::join_paths(paths) {
        Ok(joined) => env::set_var(VAR, joined),
        Err(err) => warn!(%err, "cannot extend library search path"),
    }
}

/// Formats each native log line and re-emits it at the closest `tracing`
/// level. Anything above the configured native level is dropped here
/// rather than formatted and thrown away.
unsafe extern "C" fn forward_av_log(
    avcl: *mut c_void,
    level: c_int,
    fmt: *const c_char,
    args: ffi::va_list,
) {
    if level > ffi::av_log_get_level() {
        return;
    }

    let mut line = [0u8; 1024];
    let mut print_prefix: c_int = 1;
    ffi::av_log_format_line(
        avcl,
        level,
        fmt,
        args,
        line.as_mut_ptr().cast::<c_char>(),
        line.len() as c_int,
        &mut print_prefix,
    );
    let text = CStr::from_ptr(line.as_ptr().cast::<c_char>()).to_string_lossy();
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }

    if level <= ffi::AV_LOG_ERROR as c_int {
        error!(target: "ffmpeg", "{text}");
    } else if level <= ffi::AV_LOG_WARNING as c_int {
        warn!(target: "ffmpeg", "{text}");
    } else if level <= ffi::AV_LOG_INFO as c_int {
        info!(target: "ffmpeg", "{text}");
    } else {
        trace!(target: "ffmpeg", "{text}");
    }
}
