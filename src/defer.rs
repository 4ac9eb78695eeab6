use std::ops::{Deref, DerefMut};

/// Runs a cleanup closure on a value when the guard goes out of scope, unless
/// the value is taken back with [`Deferred::undefer`].
///
/// Used to unwind partially constructed Vulkan objects when a later step in a
/// construction sequence fails with `?`.
pub trait Defer: Sized {
    fn defer<F: FnOnce(Self)>(self, cleanup: F) -> Deferred<Self, F>;
}

impl<T> Defer for T {
    fn defer<F: FnOnce(Self)>(self, cleanup: F) -> Deferred<Self, F> {
        Deferred {
            value: Some(self),
            cleanup: Some(cleanup),
        }
    }
}

pub struct Deferred<T, F: FnOnce(T)> {
    value: Option<T>,
    cleanup: Option<F>,
}

impl<T, F: FnOnce(T)> Deferred<T, F> {
    /// Disarms the guard and hands back ownership of the value.
    pub fn undefer(mut self) -> T {
        self.cleanup = None;
        // value is only ever None after drop or undefer, both of which consume self
        self.value.take().unwrap()
    }
}

impl<T, F: FnOnce(T)> Deref for Deferred<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().unwrap()
    }
}

impl<T, F: FnOnce(T)> DerefMut for Deferred<T, F> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap()
    }
}

impl<T, F: FnOnce(T)> Drop for Deferred<T, F> {
    fn drop(&mut self) {
        if let (Some(value), Some(cleanup)) = (self.value.take(), self.cleanup.take()) {
            cleanup(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::Defer;

    #[test]
    fn cleanup_runs_on_drop() {
        let cleaned = Cell::new(0);
        {
            let _guard = 5.defer(|x| cleaned.set(x));
        }
        assert_eq!(cleaned.get(), 5);
    }

    #[test]
    fn undefer_skips_cleanup() {
        let cleaned = Cell::new(false);
        let value = 7.defer(|_| cleaned.set(true)).undefer();
        assert_eq!(value, 7);
        assert!(!cleaned.get());
    }

    #[test]
    fn deref_reaches_value() {
        let guard = vec![1, 2, 3].defer(drop);
        assert_eq!(guard.len(), 3);
    }
}
