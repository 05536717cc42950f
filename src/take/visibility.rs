//! "Work in progress" visibility flag for temp takes
//!
//! On Windows the temp take carries the hidden attribute while it is being
//! written. On Unix the dot-prefixed temp name already hides it and the rename
//! to `track_<T>.wav` reveals it, so the hook only logs.

use std::path::Path;
use std::sync::Arc;

pub trait VisibilityHook: Send + Sync {
    fn mark_temporary(&self, path: &Path);
    fn unmark_temporary(&self, path: &Path);
}

/// Hook for platforms without a hidden-file attribute.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVisibility;

impl VisibilityHook for NoopVisibility {
    fn mark_temporary(&self, path: &Path) {
        log::debug!("Visibility: no hidden attribute on this platform ({:?})", path);
    }

    fn unmark_temporary(&self, path: &Path) {
        log::debug!("Visibility: no hidden attribute on this platform ({:?})", path);
    }
}

/// Sets/clears the Windows hidden attribute via `attrib`.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct HiddenAttribute;

#[cfg(windows)]
impl HiddenAttribute {
    fn attrib(flag: &str, path: &Path) {
        match std::process::Command::new("attrib").arg(flag).arg(path).status() {
            Ok(status) if status.success() => {
                log::debug!("Visibility: attrib {} {:?}", flag, path);
            }
            Ok(status) => log::warn!("Visibility: attrib {} {:?} exited with {}", flag, path, status),
            Err(e) => log::warn!("Visibility: attrib {} {:?} failed: {}", flag, path, e),
        }
    }
}

#[cfg(windows)]
impl VisibilityHook for HiddenAttribute {
    fn mark_temporary(&self, path: &Path) {
        Self::attrib("+H", path);
    }

    fn unmark_temporary(&self, path: &Path) {
        Self::attrib("-H", path);
    }
}

/// The hook for the current platform.
pub fn platform_hook() -> Arc<dyn VisibilityHook> {
    #[cfg(windows)]
    {
        Arc::new(HiddenAttribute)
    }
    #[cfg(not(windows))]
    {
        Arc::new(NoopVisibility)
    }
}
