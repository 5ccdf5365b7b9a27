//! Shutdown hook list.
//!
//! Hooks run once, most recently registered first. Registration is keyed by
//! `(callback, argument)`; a second registration of the same pair is
//! ignored. Once [`ShutdownHooks::run`] has started the list is frozen.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Plain shutdown callback taking the registered argument.
pub type ShutdownFn = fn(usize);

/// Identity of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HookKey {
    pub(crate) callback: usize,
    pub(crate) arg: usize,
}

struct Hook {
    name: String,
    key: HookKey,
    action: Box<dyn FnOnce() + Send>,
}

/// Process shutdown hooks.
#[derive(Default)]
pub struct ShutdownHooks {
    /// Last element is the head.
    hooks: Mutex<Vec<Hook>>,
    in_progress: AtomicBool,
}

static GLOBAL: LazyLock<Arc<ShutdownHooks>> = LazyLock::new(|| Arc::new(ShutdownHooks::new()));

impl ShutdownHooks {
    /// Empty hook list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide hook list.
    pub fn global() -> Arc<ShutdownHooks> {
        Arc::clone(&GLOBAL)
    }

    /// Register `callback(arg)` to run at shutdown.
    ///
    /// Returns `false` if the pair is already registered or shutdown has
    /// begun.
    pub fn register(&self, name: &str, callback: ShutdownFn, arg: usize) -> bool {
        let key = HookKey {
            callback: callback as usize,
            arg,
        };
        self.register_action(name, key, Box::new(move || callback(arg)))
    }

    pub(crate) fn register_action(
        &self,
        name: &str,
        key: HookKey,
        action: Box<dyn FnOnce() + Send>,
    ) -> bool {
        let mut hooks = self.hooks.lock();
        if self.in_progress.load(Ordering::Acquire) {
            return false;
        }
        if hooks.iter().any(|h| h.key == key) {
            return false;
        }
        hooks.push(Hook {
            name: name.to_string(),
            key,
            action,
        });
        true
    }

    /// Remove the registration of `callback(arg)`.
    ///
    /// Returns `false` if it was not registered or shutdown has begun.
    pub fn unregister(&self, callback: ShutdownFn, arg: usize) -> bool {
        self.unregister_key(HookKey {
            callback: callback as usize,
            arg,
        })
    }

    pub(crate) fn unregister_key(&self, key: HookKey) -> bool {
        let mut hooks = self.hooks.lock();
        if self.in_progress.load(Ordering::Acquire) {
            return false;
        }
        let before = hooks.len();
        hooks.retain(|h| h.key != key);
        hooks.len() != before
    }

    /// Run every hook, head first. Hooks registered during the run are
    /// refused; a second call finds the list empty.
    pub fn run(&self) {
        {
            let _hooks = self.hooks.lock();
            self.in_progress.store(true, Ordering::Release);
        }
        loop {
            // The lock is released before the hook runs.
            let Some(hook) = self.hooks.lock().pop() else {
                break;
            };
            debug!(hook = %hook.name, "running shutdown hook");
            (hook.action)();
            debug!(hook = %hook.name, "shutdown hook complete");
        }
    }

    /// Returns `true` once [`run`](Self::run) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Registered hook names, head first.
    pub fn names(&self) -> Vec<String> {
        self.hooks.lock().iter().rev().map(|h| h.name.clone()).collect()
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Returns `true` if no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    static ORDER: PlMutex<Vec<usize>> = PlMutex::new(Vec::new());

    fn push_order(arg: usize) {
        ORDER.lock().push(arg);
    }

    #[test]
    fn test_runs_lifo_and_dedups() {
        let hooks = ShutdownHooks::new();
        assert!(hooks.register("a", push_order, 1));
        assert!(hooks.register("b", push_order, 2));
        assert!(!hooks.register("b again", push_order, 2));
        assert!(hooks.register("c", push_order, 3));
        assert_eq!(hooks.names(), vec!["c", "b", "a"]);

        assert!(hooks.unregister(push_order, 3));
        assert!(!hooks.unregister(push_order, 3));

        ORDER.lock().clear();
        hooks.run();
        assert_eq!(*ORDER.lock(), vec![2, 1]);
        assert!(hooks.is_empty());
        assert!(hooks.is_shutting_down());
    }

    #[test]
    fn test_registration_refused_during_shutdown() {
        let hooks = Arc::new(ShutdownHooks::new());
        let inner = Arc::clone(&hooks);
        let refused = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&refused);
        hooks.register_action(
            "nested",
            HookKey { callback: 1, arg: 0 },
            Box::new(move || {
                let accepted = inner.register_action("late", HookKey { callback: 2, arg: 0 }, Box::new(|| {}));
                let removed = inner.unregister_key(HookKey { callback: 1, arg: 0 });
                flag.store(!accepted && !removed, Ordering::SeqCst);
            }),
        );
        hooks.run();
        assert!(refused.load(Ordering::SeqCst));
        assert!(hooks.is_empty());
    }
}
