//! Sticky build status.
//!
//! Builder operations run deep inside nested loop construction code. Rather
//! than returning a `Result` from every call, the context owns a
//! [`BuildStatus`] that keeps the *first* error and ignores later ones.
//! Callers keep pairing `begin_loop`/`end_loop` structurally and look at the
//! status once, before executing.

use crate::error::{MvpError, Result};

/// First-error accumulator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildStatus {
    first: Option<MvpError>,
}

impl BuildStatus {
    /// Fresh, successful status.
    pub const fn new() -> Self {
        Self { first: None }
    }

    /// Record `err` unless an earlier error is already held.
    pub fn record(&mut self, err: MvpError) {
        if self.first.is_none() {
            tracing::trace!("build status set: {err}");
            self.first = Some(err);
        }
    }

    /// Record the error produced by `err` when `cond` is false.
    ///
    /// Returns `cond`, so checks read like assertions at the call site.
    pub fn check(&mut self, cond: bool, err: impl FnOnce() -> MvpError) -> bool {
        if !cond {
            self.record(err());
        }
        cond
    }

    /// Fold a fallible value into the status.
    pub fn absorb<T>(&mut self, value: Result<T>) -> Option<T> {
        match value {
            Ok(v) => Some(v),
            Err(e) => {
                self.record(e);
                None
            }
        }
    }

    /// True while no error has been recorded.
    pub fn is_ok(&self) -> bool {
        self.first.is_none()
    }

    /// The recorded error, if any.
    pub fn error(&self) -> Option<&MvpError> {
        self.first.as_ref()
    }

    /// `Ok(())` or a copy of the first error.
    ///
    /// # Errors
    ///
    /// Returns the first recorded error.
    pub fn to_result(&self) -> Result<()> {
        match &self.first {
            None => Ok(()),
            Some(e) => Err(e.clone()),
        }
    }

    /// Forget any recorded error.
    pub fn reset(&mut self) {
        self.first = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_first_error_only() {
        let mut s = BuildStatus::new();
        assert!(s.is_ok());
        s.record(MvpError::invalid_range("first"));
        s.record(MvpError::invalid_parameter("second"));
        assert_eq!(s.to_result(), Err(MvpError::invalid_range("first")));
    }

    #[test]
    fn check_and_absorb() {
        let mut s = BuildStatus::new();
        assert!(s.check(true, || MvpError::fail("unused")));
        assert_eq!(s.absorb(Ok::<_, MvpError>(5)), Some(5));
        assert!(s.is_ok());
        assert!(!s.check(false, || MvpError::fail("boom")));
        assert_eq!(s.absorb::<u8>(Err(MvpError::fail("later"))), None);
        assert_eq!(s.error(), Some(&MvpError::fail("boom")));
        s.reset();
        assert!(s.is_ok());
    }
}
