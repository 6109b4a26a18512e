// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Single-use (or streaming) reply slots.
//!
//! A [`Deferred`] is handed to whoever is responsible for producing a reply.
//! Whatever happens to it — resolved, rejected, moved across threads, or
//! simply dropped on an early-return path — the bound callback observes
//! exactly one terminal signal. That property is what lets a host promise
//! its peer one final `InvokeMethodReply` per request without relying on
//! every handler remembering to answer.

/// A reply envelope: an optional payload plus the streaming continuation
/// flag. `success()` is defined as payload presence.
#[derive(Debug)]
pub struct AsyncResult<T> {
    msg: Option<T>,
    has_more: bool,
}

impl<T> AsyncResult<T> {
    pub fn new(msg: T) -> Self {
        AsyncResult {
            msg: Some(msg),
            has_more: false,
        }
    }

    /// A failure marker: no payload, terminal.
    pub fn failure() -> Self {
        AsyncResult {
            msg: None,
            has_more: false,
        }
    }

    pub fn from_parts(msg: Option<T>, has_more: bool) -> Self {
        AsyncResult { msg, has_more }
    }

    pub fn with_has_more(mut self, has_more: bool) -> Self {
        self.has_more = has_more;
        self
    }

    pub fn success(&self) -> bool {
        self.msg.is_some()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn msg(&self) -> Option<&T> {
        self.msg.as_ref()
    }

    pub fn into_msg(self) -> Option<T> {
        self.msg
    }
}

type Callback<T> = Box<dyn FnMut(AsyncResult<T>) + Send>;

/// A response slot with at most one bound callback and at most one terminal
/// fire.
///
/// `resolve` with `has_more = true` keeps the slot armed for further
/// resolutions; any other `resolve`, a `reject`, or dropping an armed slot
/// clears it. Operations on a cleared slot are ignored.
pub struct Deferred<T = Vec<u8>> {
    callback: Option<Callback<T>>,
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Deferred { callback: None }
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Binds `callback`, releasing any previously bound callback without
    /// invoking it.
    pub fn bind<F>(&mut self, callback: F)
    where
        F: FnMut(AsyncResult<T>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Creates an already-bound slot.
    pub fn bound<F>(callback: F) -> Self
    where
        F: FnMut(AsyncResult<T>) + Send + 'static,
    {
        let mut deferred = Deferred::new();
        deferred.bind(callback);
        deferred
    }

    pub fn is_bound(&self) -> bool {
        self.callback.is_some()
    }

    /// Fires the callback with `result`. Terminal unless `result.has_more()`.
    pub fn resolve(&mut self, result: AsyncResult<T>) {
        if result.has_more() {
            if let Some(callback) = self.callback.as_mut() {
                callback(result);
            }
        } else if let Some(mut callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Fires the callback once with a failure marker and clears the slot.
    pub fn reject(&mut self) {
        if let Some(mut callback) = self.callback.take() {
            callback(AsyncResult::failure());
        }
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        // A slot dropped while still armed owes its caller a terminal
        // answer; this is the unwinding-safety half of the contract.
        self.reject();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn bind_and_resolve_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut deferred = Deferred::new();
        let counted = calls.clone();
        deferred.bind(move |result: AsyncResult<u32>| {
            assert!(result.success());
            assert_eq!(Some(&42), result.msg());
            counted.fetch_add(1, Ordering::SeqCst);
        });

        deferred.resolve(AsyncResult::new(42));
        // Terminal: later operations are no-ops.
        deferred.resolve(AsyncResult::new(43));
        deferred.reject();
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn reject_delivers_a_failure_marker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut deferred = Deferred::new();
        let counted = calls.clone();
        deferred.bind(move |result: AsyncResult<u32>| {
            assert!(!result.success());
            counted.fetch_add(1, Ordering::SeqCst);
        });

        deferred.reject();
        deferred.resolve(AsyncResult::new(1));
        deferred.reject();
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_an_armed_slot_rejects_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let counted = calls.clone();
            let _deferred = Deferred::<u32>::bound(move |result| {
                assert!(!result.success());
                counted.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn rebinding_releases_the_first_callback_without_invoking_it() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let first_drops = Arc::new(AtomicUsize::new(0));

        struct DropProbe(Arc<AtomicUsize>);
        impl Drop for DropProbe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut deferred = Deferred::<u32>::new();
        let probe = DropProbe(first_drops.clone());
        let counted = first_calls.clone();
        deferred.bind(move |_| {
            let _keep_alive = &probe;
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let second_calls = Arc::new(AtomicUsize::new(0));
        let counted = second_calls.clone();
        deferred.bind(move |result: AsyncResult<u32>| {
            assert_eq!(Some(&7), result.msg());
            counted.fetch_add(1, Ordering::SeqCst);
        });
        // The first callback's captures are gone and it never fired.
        assert_eq!(1, first_drops.load(Ordering::SeqCst));
        assert_eq!(0, first_calls.load(Ordering::SeqCst));

        deferred.resolve(AsyncResult::new(7));
        assert_eq!(1, second_calls.load(Ordering::SeqCst));
    }

    #[test]
    fn moving_transfers_the_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let deferred = Deferred::<u32>::bound(move |result| {
            assert!(result.success());
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let mut moved = deferred;
        moved.resolve(AsyncResult::new(1));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn streaming_reply_keeps_the_slot_armed_until_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let mut deferred = Deferred::<u32>::bound(move |result| {
            let n = counted.fetch_add(1, Ordering::SeqCst) as u32;
            assert!(result.success());
            assert_eq!(Some(&n), result.msg());
            assert_eq!(n < 3, result.has_more());
        });

        for i in 0..3 {
            deferred.resolve(AsyncResult::new(i).with_has_more(true));
        }
        deferred.resolve(AsyncResult::new(3));
        assert_eq!(4, calls.load(Ordering::SeqCst));

        // Terminal already delivered: a late reject is a no-op.
        deferred.reject();
        assert_eq!(4, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn streaming_reply_dropped_mid_stream_rejects() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let counted = calls.clone();
            let mut deferred = Deferred::<u32>::bound(move |result| {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                assert_eq!(n < 3, result.success());
                assert_eq!(result.success(), result.has_more());
            });
            for i in 0..3 {
                deferred.resolve(AsyncResult::new(i).with_has_more(true));
            }
        }
        // Three streamed payloads plus the drop-driven reject.
        assert_eq!(4, calls.load(Ordering::SeqCst));
    }
}
