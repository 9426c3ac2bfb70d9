//! Build identity reported by the info operation.

pub const APP_NAME: &str = "tidings";

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Git commit the binary was built from, when the build environment
/// provided one.
pub fn git_commit() -> Option<&'static str> {
    option_env!("TIDINGS_GIT_COMMIT")
}

/// Build timestamp, when the build environment provided one.
pub fn build_time() -> Option<&'static str> {
    option_env!("TIDINGS_BUILD_TIME")
}
