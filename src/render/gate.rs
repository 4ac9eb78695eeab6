use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Loading,
    Ready,
}

/// One-shot hand-off of fully built resources from the loader thread to the
/// frame loop.
///
/// The loader publishes exactly once. Readers that observe [`ResourceState::Ready`]
/// also observe every write made to the resources before publishing.
pub struct ReadinessGate<T> {
    ready: AtomicBool,
    resources: OnceLock<T>,
}

impl<T> Default for ReadinessGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadinessGate<T> {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            resources: OnceLock::new(),
        }
    }

    pub fn state(&self) -> ResourceState {
        if self.ready.load(Ordering::Acquire) {
            ResourceState::Ready
        } else {
            ResourceState::Loading
        }
    }

    /// Hands the resources over. A second publish is refused and gets its value back.
    pub fn publish(&self, resources: T) -> Result<(), T> {
        self.resources.set(resources)?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// The published resources, or `None` while still loading.
    pub fn get(&self) -> Option<&T> {
        match self.state() {
            ResourceState::Ready => self.resources.get(),
            ResourceState::Loading => None,
        }
    }

    pub fn into_inner(self) -> Option<T> {
        self.resources.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{ReadinessGate, ResourceState};

    #[test]
    fn starts_loading() {
        let gate = ReadinessGate::<u32>::new();
        assert_eq!(gate.state(), ResourceState::Loading);
        assert!(gate.get().is_none());
        assert_eq!(gate.into_inner(), None);
    }

    #[test]
    fn publishes_once() {
        let gate = ReadinessGate::new();
        assert_eq!(gate.publish(7), Ok(()));
        assert_eq!(gate.state(), ResourceState::Ready);
        assert_eq!(gate.get(), Some(&7));

        assert_eq!(gate.publish(8), Err(8));
        assert_eq!(gate.get(), Some(&7));
        assert_eq!(gate.into_inner(), Some(7));
    }

    #[test]
    fn ready_implies_visible_resources() {
        let gate = Arc::new(ReadinessGate::new());

        let loader = {
            let gate = gate.clone();
            thread::spawn(move || {
                let resources: Vec<u64> = (0..4096).collect();
                gate.publish(resources).expect("published twice");
            })
        };

        loop {
            if let Some(resources) = gate.get() {
                assert_eq!(resources.len(), 4096);
                assert_eq!(resources[4095], 4095);
                break;
            }
            thread::yield_now();
        }

        loader.join().unwrap();
        assert_eq!(gate.state(), ResourceState::Ready);
    }
}
