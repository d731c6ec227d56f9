//! Release-on-failure bookkeeping for multi-step acquisition

/// Undo actions for resources acquired so far
///
/// Each acquisition step pushes the action that releases it. If the guard is
/// dropped before [`Unwind::disarm`] the actions run newest first, so a failed
/// open releases interfaces and the device in reverse order of acquisition.
#[derive(Default)]
pub struct Unwind<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Unwind<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: impl FnOnce() + 'a) {
        self.actions.push(Box::new(action));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Acquisition succeeded; forget the undo actions
    pub fn disarm(mut self) {
        self.actions.clear();
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_runs_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        {
            let mut unwind = Unwind::new();
            unwind.push(|| log.borrow_mut().push("device"));
            unwind.push(|| log.borrow_mut().push("interface 0"));
            unwind.push(|| log.borrow_mut().push("interface 1"));
            assert_eq!(unwind.len(), 3);
        }
        assert_eq!(*log.borrow(), vec!["interface 1", "interface 0", "device"]);
    }

    #[test]
    fn test_disarm_skips_actions() {
        let log = RefCell::new(Vec::<&str>::new());
        let mut unwind = Unwind::new();
        unwind.push(|| log.borrow_mut().push("release"));
        unwind.disarm();
        assert!(log.borrow().is_empty());
    }
}
