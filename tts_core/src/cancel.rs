use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::{Result, SynthesisError};

#[derive(Debug, Default)]
struct Flag {
    cancelled: AtomicBool,
    parent: Option<Arc<Flag>>,
}

/// Cooperative cancellation, checked between decode chunks.
///
/// A child token fires when either it or any ancestor is cancelled;
/// cancelling a child leaves its parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<Flag>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(Flag {
                cancelled: AtomicBool::new(false),
                parent: Some(self.flag.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.flag.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut flag = Some(&self.flag);
        while let Some(f) = flag {
            if f.cancelled.load(Ordering::Acquire) {
                return true;
            }
            flag = f.parent.as_ref();
        }
        false
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SynthesisError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_sees_parent_but_not_reverse() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.check().is_err());
    }
}
