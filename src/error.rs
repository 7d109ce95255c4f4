// ABOUTME: Crate-root error/result aliases for the outermost (listener/binary) boundary
// ABOUTME: Internal modules keep their own thiserror enums; this is only the final catch-all

/// Error returned by the outermost boundary (the listener and the binary's
/// `main`).
///
/// Internal modules define their own structured `thiserror` enums
/// (`FrameError`, `AuthError`, `XferError`, `ConfigError`, `FdoError`, ...)
/// precisely because those are hit and handled during normal execution.
/// This boxed type is for the handful of places that only need to report a
/// failure upward and exit, not branch on its cause.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Convenience `Result` alias paired with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
