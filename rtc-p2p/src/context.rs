use std::thread::{self, ThreadId};

/// The single execution context that owns a transport channel and
/// everything below it.
///
/// Entry points call [`NetworkContext::assert_current`]; calling in from
/// another thread is a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkContext {
    thread: ThreadId,
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self::current()
    }
}

impl NetworkContext {
    /// Binds to the calling thread.
    pub fn current() -> Self {
        Self {
            thread: thread::current().id(),
        }
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    #[track_caller]
    pub fn assert_current(&self) {
        debug_assert!(
            self.is_current(),
            "called from {:?}, outside of the network context {:?}",
            thread::current().id(),
            self.thread
        );
    }
}
