use std::fmt::Display;

/// A generic, type-erased error.
///
/// Used wherever callers only need to report or log a failure rather than match on it. Errors
/// that form a closed set callers are expected to branch on should get their own type instead.
pub type GenericError = anyhow::Error;

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

/// Macro for constructing a generic error.
///
/// The resulting value evaluates to [`GenericError`] and can be constructed from a string
/// literal, a format string (with arguments, in the same order as `std::format!`), or any value
/// implementing `Debug` and `Display`, such as an existing `std::error::Error`. When given an
/// existing error, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    // Forwards to `anyhow::anyhow`. We wrap it rather than re-export it so the documentation
    // callers see isn't anyhow-specific.
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// Wraps `anyhow::Context` so the extension methods don't collide with `snafu::ResultExt` in
// crates that use both.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily, only if an error
    /// occurs.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}
