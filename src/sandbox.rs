//! Error-state sandbox for instrumentation probes
//!
//! A probe (an integration callback, a tag extractor, anything the agent
//! runs on the host's behalf) may report errors, switch the error-handling
//! mode, or throw. None of that may leak into what the application sees.
//! [`SandboxGuard::begin`] snapshots the host's error state and silences
//! reporting; dropping the guard puts everything back.
//!
//! # Release rules
//!
//! The snapshot shares the last error's message and file with the host.
//! On restore the host's *current* message/file are compared by identity
//! against the snapshot:
//!
//! - identical: the probe reported nothing, nothing is released
//! - different: the probe reported a new error; its strings are released
//!   and the snapshot's strings put back
//!
//! Restore runs exactly once per begin, on normal return, early return,
//! `?` propagation and panic unwinding alike.

use std::sync::Arc;

use tracing::trace;

use crate::host::{ErrorGlobals, ErrorHandling, LastError, PendingException};

/// Access to the host's error-reporting globals
pub trait ErrorHost {
    fn error_handling(&self) -> ErrorHandling;
    fn set_error_handling(&self, mode: ErrorHandling);
    fn last_error(&self) -> LastError;
    /// Install `error`, returning the displaced last error
    fn replace_last_error(&self, error: LastError) -> LastError;
    fn error_reporting(&self) -> i32;
    fn set_error_reporting(&self, level: i32);
    /// Install `exception` as the in-flight exception, returning the old one
    fn replace_exception(&self, exception: Option<PendingException>) -> Option<PendingException>;
}

impl ErrorHost for ErrorGlobals {
    fn error_handling(&self) -> ErrorHandling {
        self.mode()
    }

    fn set_error_handling(&self, mode: ErrorHandling) {
        self.set_mode(mode);
    }

    fn last_error(&self) -> LastError {
        ErrorGlobals::last_error(self)
    }

    fn replace_last_error(&self, error: LastError) -> LastError {
        ErrorGlobals::replace_last_error(self, error)
    }

    fn error_reporting(&self) -> i32 {
        ErrorGlobals::error_reporting(self)
    }

    fn set_error_reporting(&self, level: i32) {
        ErrorGlobals::set_error_reporting(self, level);
    }

    fn replace_exception(&self, exception: Option<PendingException>) -> Option<PendingException> {
        ErrorGlobals::replace_exception(self, exception)
    }
}

/// Snapshot of the host's error state
#[derive(Debug, Clone)]
pub struct ErrorBackup {
    pub mode: ErrorHandling,
    pub error_type: i32,
    pub message: Option<Arc<str>>,
    pub file: Option<Arc<str>>,
    pub line: u32,
    pub error_reporting: i32,
    pub exception: Option<PendingException>,
}

/// What a restore had to clean up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// The probe's error message was released
    pub released_message: bool,
    /// The probe's error file was released
    pub released_file: bool,
    /// The probe left an exception behind, which was discarded
    pub discarded_exception: bool,
}

impl ErrorBackup {
    /// Snapshot `host` and switch it into sandbox mode
    ///
    /// Reporting is silenced and the error-handling mode set to `mode`. Any
    /// in-flight exception is parked in the backup so the probe starts
    /// clean.
    pub fn capture<H: ErrorHost + ?Sized>(host: &H, mode: ErrorHandling) -> Self {
        let last = host.last_error();
        let backup = Self {
            mode: host.error_handling(),
            error_type: last.error_type,
            message: last.message,
            file: last.file,
            line: last.line,
            error_reporting: host.error_reporting(),
            exception: host.replace_exception(None),
        };
        host.set_error_reporting(0);
        host.set_error_handling(mode);
        backup
    }

    /// Put `host` back into the captured state
    pub fn restore<H: ErrorHost + ?Sized>(self, host: &H) -> RestoreOutcome {
        let current = host.last_error();
        let released_message = is_replaced(&current.message, &self.message);
        let released_file = is_replaced(&current.file, &self.file);
        drop(current);

        // Dropping the displaced error releases the probe's strings; the
        // snapshot's strings move back into the host untouched.
        let displaced = host.replace_last_error(LastError {
            error_type: self.error_type,
            message: self.message,
            file: self.file,
            line: self.line,
        });
        drop(displaced);

        host.set_error_handling(self.mode);
        host.set_error_reporting(self.error_reporting);
        let discarded_exception = host.replace_exception(self.exception).is_some();

        let outcome = RestoreOutcome {
            released_message,
            released_file,
            discarded_exception,
        };
        trace!(?outcome, "error state restored");
        outcome
    }
}

fn is_replaced(current: &Option<Arc<str>>, saved: &Option<Arc<str>>) -> bool {
    match (current, saved) {
        (Some(current), Some(saved)) => !Arc::ptr_eq(current, saved),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Scoped sandbox: restores the host's error state when dropped
///
/// # Example
///
/// ```
/// use tracehook::host::{ErrorGlobals, E_WARNING};
/// use tracehook::sandbox::SandboxGuard;
///
/// let globals = ErrorGlobals::new();
/// {
///     let _sandbox = SandboxGuard::begin(&globals);
///     globals.report(E_WARNING, "probe failed", "probe.php", 3);
/// }
/// assert!(globals.last_error().message.is_none());
/// ```
pub struct SandboxGuard<'h, H: ErrorHost + ?Sized> {
    host: &'h H,
    backup: Option<ErrorBackup>,
}

impl<'h, H: ErrorHost + ?Sized> SandboxGuard<'h, H> {
    /// Enter the sandbox, converting errors to exceptions while inside
    pub fn begin(host: &'h H) -> Self {
        Self::begin_with_mode(host, ErrorHandling::Throw)
    }

    pub fn begin_with_mode(host: &'h H, mode: ErrorHandling) -> Self {
        Self {
            host,
            backup: Some(ErrorBackup::capture(host, mode)),
        }
    }

    pub fn backup(&self) -> Option<&ErrorBackup> {
        self.backup.as_ref()
    }

    /// Leave the sandbox now and report what was cleaned up
    pub fn end(mut self) -> RestoreOutcome {
        self.backup
            .take()
            .map(|backup| backup.restore(self.host))
            .unwrap_or_default()
    }
}

impl<H: ErrorHost + ?Sized> Drop for SandboxGuard<'_, H> {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            backup.restore(self.host);
        }
    }
}

/// Run `probe` inside a sandbox on `host`
pub fn sandboxed<H, F, R>(host: &H, probe: F) -> R
where
    H: ErrorHost + ?Sized,
    F: FnOnce(&H) -> R,
{
    let _guard = SandboxGuard::begin(host);
    probe(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{E_ALL, E_NOTICE, E_WARNING};

    #[test]
    fn test_clean_probe_releases_nothing() {
        let globals = ErrorGlobals::new();
        globals.report(E_NOTICE, "before", "app.php", 10);
        let before = globals.last_error();

        let guard = SandboxGuard::begin(&globals);
        assert_eq!(globals.error_reporting(), 0);
        assert_eq!(globals.mode(), ErrorHandling::Throw);
        let outcome = guard.end();

        assert_eq!(outcome, RestoreOutcome::default());
        let after = globals.last_error();
        assert!(Arc::ptr_eq(
            before.message.as_ref().unwrap(),
            after.message.as_ref().unwrap()
        ));
        assert!(Arc::ptr_eq(before.file.as_ref().unwrap(), after.file.as_ref().unwrap()));
        assert_eq!(after.line, 10);
        assert_eq!(globals.error_reporting(), E_ALL);
        assert_eq!(globals.mode(), ErrorHandling::Normal);
    }

    #[test]
    fn test_failing_probe_strings_are_released() {
        let globals = ErrorGlobals::new();
        globals.report(E_NOTICE, "before", "app.php", 10);

        let guard = SandboxGuard::begin(&globals);
        globals.report(E_WARNING, "probe", "probe.php", 99);
        let probe_message = Arc::downgrade(globals.last_error().message.as_ref().unwrap());
        let outcome = guard.end();

        assert!(outcome.released_message);
        assert!(outcome.released_file);
        assert!(probe_message.upgrade().is_none());

        let after = globals.last_error();
        assert_eq!(after.message.as_deref(), Some("before"));
        assert_eq!(after.file.as_deref(), Some("app.php"));
        assert_eq!(after.error_type, E_NOTICE);
        assert_eq!(after.line, 10);
    }

    #[test]
    fn test_error_without_prior_error() {
        let globals = ErrorGlobals::new();
        sandboxed(&globals, |host| host.report(E_WARNING, "oops", "x.php", 1));
        assert!(globals.last_error().message.is_none());
        assert!(globals.last_error().file.is_none());
    }

    #[test]
    fn test_exception_is_parked_and_restored() {
        let globals = ErrorGlobals::new();
        globals.throw("RuntimeException", "application");

        let guard = SandboxGuard::begin(&globals);
        assert!(globals.exception().is_none());
        globals.throw("LogicException", "probe");
        let outcome = guard.end();

        assert!(outcome.discarded_exception);
        assert_eq!(globals.exception().unwrap().message, "application");
    }

    #[test]
    fn test_restore_on_panic() {
        let globals = ErrorGlobals::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sandboxed(&globals, |host| {
                host.report(E_WARNING, "probe", "probe.php", 1);
                panic!("probe crashed");
            })
        }));

        assert!(result.is_err());
        assert!(globals.last_error().message.is_none());
        assert_eq!(globals.error_reporting(), E_ALL);
    }

    #[test]
    fn test_is_replaced() {
        let a: Arc<str> = Arc::from("a");
        let a2: Arc<str> = Arc::from("a");
        assert!(!is_replaced(&Some(a.clone()), &Some(a.clone())));
        assert!(is_replaced(&Some(a2), &Some(a)));
        assert!(is_replaced(&Some(Arc::from("x")), &None));
        assert!(!is_replaced(&None, &None));
    }
}
