//! Hook slots and the registry that tears them down
//!
//! A [`HookSlot`] owns one interceptor for one extension point. Installing
//! it saves whatever the point dispatched to before and redirects the point
//! to the interceptor; the interceptor later reaches the saved handler via
//! [`HookSlot::previous`]. Only one chain depth is tracked: if a third party
//! hooked the point before us, *their* handler becomes our previous one.
//!
//! Uninstalling checks ownership first. The point is restored only while
//! it still dispatches to our interceptor; if someone re-hooked it after
//! us, a blind restore would silently disable their hook, so the point is
//! left alone.
//!
//! ```text
//!   install:    point ──► interceptor ──► previous
//!   re-hooked:  point ──► third party ──► interceptor ──► previous
//!   uninstall:  (re-hooked) no-op, otherwise point ──► previous
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::host::ExtensionPoint;

/// One interceptor for one extension point
pub struct HookSlot<F> {
    name: &'static str,
    interceptor: F,
    previous: RwLock<Option<F>>,
    installed: AtomicBool,
}

impl<F: Copy + PartialEq + 'static> HookSlot<F> {
    pub const fn new(name: &'static str, interceptor: F) -> Self {
        Self {
            name,
            interceptor,
            previous: RwLock::new(None),
            installed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interceptor(&self) -> F {
        self.interceptor
    }

    /// Handler that was active before this slot was installed
    pub fn previous(&self) -> Option<F> {
        *self.previous.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the previous handler, leaving none behind
    pub fn take_previous(&self) -> Option<F> {
        self.previous
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Does `point` currently dispatch to this slot's interceptor?
    pub fn owns<P: ExtensionPoint<F> + ?Sized>(&self, point: &P) -> bool {
        point.current() == Some(self.interceptor)
    }

    /// Save the point's current handler and redirect it to the interceptor
    ///
    /// Returns the saved handler. Installing over our own interceptor would
    /// make the interceptor its own previous handler, so that case keeps the
    /// existing chain.
    pub fn install<P: ExtensionPoint<F> + ?Sized>(&self, point: &P) -> Option<F> {
        if self.owns(point) {
            debug!(slot = self.name, point = point.name(), "hook already installed");
            return self.previous();
        }

        let previous = point.current();
        *self.previous.write().unwrap_or_else(PoisonError::into_inner) = previous;
        point.set(Some(self.interceptor));

        let installed = self.owns(point);
        self.installed.store(installed, Ordering::Release);
        if installed {
            debug!(
                slot = self.name,
                point = point.name(),
                chained = previous.is_some(),
                "hook installed"
            );
        } else {
            debug!(slot = self.name, point = point.name(), "extension point rejected hook");
        }
        previous
    }

    /// Restore the saved handler if the point still dispatches to us
    ///
    /// Returns `true` if the point was restored.
    pub fn uninstall<P: ExtensionPoint<F> + ?Sized>(&self, point: &P) -> bool {
        if !self.owns(point) {
            debug!(
                slot = self.name,
                point = point.name(),
                "extension point re-hooked by another party, leaving it untouched"
            );
            return false;
        }

        point.set(self.take_previous());
        self.installed.store(false, Ordering::Release);
        debug!(slot = self.name, point = point.name(), "hook uninstalled");
        true
    }
}

impl<F> fmt::Debug for HookSlot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSlot")
            .field("name", &self.name)
            .field("installed", &self.installed.load(Ordering::Relaxed))
            .finish()
    }
}

type Uninstaller = Box<dyn Fn() -> bool + Send + Sync>;

struct InstalledHook {
    name: &'static str,
    uninstall: Uninstaller,
}

/// Every hook installed at process startup, in install order
///
/// Installation happens once per process; [`HookRegistry::uninstall_all`]
/// undoes it at shutdown in reverse order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<InstalledHook>,
}

impl HookRegistry {
    pub const fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Install `slot` on `point` and remember how to undo it
    ///
    /// A slot name that is already registered is not installed again.
    /// Points that refuse the hook (for example a function the host does
    /// not provide) are not recorded.
    pub fn install<F, P>(&mut self, slot: &'static HookSlot<F>, point: P) -> Option<F>
    where
        F: Copy + PartialEq + Send + Sync + 'static,
        P: ExtensionPoint<F> + Send + Sync + 'static,
    {
        if self.contains(slot.name()) {
            debug!(slot = slot.name(), "slot already registered, skipping install");
            return slot.previous();
        }

        let previous = slot.install(&point);
        if slot.is_installed() {
            self.hooks.push(InstalledHook {
                name: slot.name(),
                uninstall: Box::new(move || slot.uninstall(&point)),
            });
        }
        previous
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.iter().any(|hook| hook.name == name)
    }

    /// Names of installed slots, in install order
    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|hook| hook.name).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Uninstall everything, newest first
    ///
    /// Returns how many extension points were actually restored; points
    /// re-hooked by someone else are skipped but still forgotten.
    pub fn uninstall_all(&mut self) -> usize {
        let mut restored = 0;
        while let Some(hook) = self.hooks.pop() {
            if (hook.uninstall)() {
                restored += 1;
            }
        }
        restored
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.names())
            .finish()
    }
}
