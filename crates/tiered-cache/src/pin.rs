use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value paired with the type-erased guard that keeps its backing data
/// pinned.
///
/// Typed views into cached data (spans, string views, sub-chunks) are handed
/// out as the `value` here, while the guard (typically a [`CellAccessor`]
/// behind an `Arc`) keeps the underlying pin alive exactly as long as the
/// view is. Data that needs no pin (e.g. growing, in-memory-only segments)
/// uses [`unpinned`](Self::unpinned).
///
/// [`CellAccessor`]: crate::CellAccessor
pub struct PinWrapper<T> {
    guard: Option<Arc<dyn Any + Send + Sync>>,
    value: T,
}

impl<T> PinWrapper<T> {
    /// Wraps a value whose validity depends on `guard` staying alive.
    pub fn new(guard: Arc<dyn Any + Send + Sync>, value: T) -> Self {
        Self {
            guard: Some(guard),
            value,
        }
    }

    /// Wraps a value that does not need a pin.
    pub fn unpinned(value: T) -> Self {
        Self { guard: None, value }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Consumes the wrapper, dropping the guard.
    ///
    /// Only sensible for values that own their data rather than borrowing
    /// from the pinned cell.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Maps the value while carrying the guard over unchanged, so a raw chunk
    /// can be adapted into a typed view without re-pinning.
    pub fn transform<U>(self, f: impl FnOnce(T) -> U) -> PinWrapper<U> {
        PinWrapper {
            guard: self.guard,
            value: f(self.value),
        }
    }
}

impl<T: Clone> Clone for PinWrapper<T> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PinWrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinWrapper")
            .field("pinned", &self.guard.is_some())
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_preserves_guard() {
        let guard: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        let tracker = Arc::downgrade(&guard);

        let wrapper = PinWrapper::new(guard, vec![1u8, 2, 3]);
        let transformed = wrapper.transform(|bytes| bytes.len());
        assert_eq!(*transformed.get(), 3);
        assert!(tracker.upgrade().is_some());

        drop(transformed);
        assert!(tracker.upgrade().is_none());
    }

    #[test]
    fn test_unpinned() {
        let mut wrapper = PinWrapper::unpinned(String::from("view"));
        wrapper.get_mut().push('s');
        assert_eq!(wrapper.get(), "views");
    }
}
