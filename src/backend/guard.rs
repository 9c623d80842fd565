// Release partially built state when setup bails out halfway

/// Holds handles made so far and runs `release` on them when dropped,
/// unless they were handed over with `into_inner`.
pub struct SetupGuard<T: Clone, F: FnOnce(&T)> {
    value: T,
    release: Option<F>,
}

impl<T: Clone, F: FnOnce(&T)> SetupGuard<T, F> {
    pub fn new(value: T, release: F) -> Self {
        Self {
            value,
            release: Some(release),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Setup succeeded: the caller owns the handles from here on
    pub fn into_inner(mut self) -> T {
        self.release = None;
        self.value.clone()
    }
}

impl<T: Clone, F: FnOnce(&T)> Drop for SetupGuard<T, F> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn fallible_setup(fail_at: usize, released: &RefCell<Vec<u32>>) -> Result<Vec<u32>, usize> {
        let mut made = SetupGuard::new(Vec::new(), |handles: &Vec<u32>| {
            released.borrow_mut().extend(handles.iter().rev());
        });
        for step in 0..3 {
            if step == fail_at {
                return Err(step);
            }
            made.get_mut().push(step as u32 + 10);
        }
        Ok(made.into_inner())
    }

    #[test]
    fn failure_releases_what_was_made_in_reverse() {
        let released = RefCell::new(Vec::new());
        assert_eq!(fallible_setup(2, &released), Err(2));
        assert_eq!(*released.borrow(), vec![11, 10]);
    }

    #[test]
    fn failure_before_anything_releases_nothing() {
        let released = RefCell::new(Vec::new());
        assert_eq!(fallible_setup(0, &released), Err(0));
        assert!(released.borrow().is_empty());
    }

    #[test]
    fn success_hands_over_without_releasing() {
        let released = RefCell::new(Vec::new());
        assert_eq!(fallible_setup(usize::MAX, &released), Ok(vec![10, 11, 12]));
        assert!(released.borrow().is_empty());
    }

    #[test]
    fn get_sees_current_state() {
        let mut guard = SetupGuard::new(1, |_| {});
        *guard.get_mut() += 1;
        assert_eq!(*guard.get(), 2);
        assert_eq!(guard.into_inner(), 2);
    }
}
