use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tracing::debug;

type ShutdownHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Ordered list of async cleanup hooks the hosting process runs during its
/// own shutdown sequence.
///
/// Hooks run exactly once, in registration order; `run_all` drains the
/// list, so calling it again is a no-op.
#[derive(Default)]
pub struct ShutdownRegistry {
    hooks: Mutex<Vec<ShutdownHook>>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        #[allow(clippy::expect_used)]
        let mut hooks = self.hooks.lock().expect("lock poisoned");
        hooks.push(Box::new(move || Box::pin(hook())));
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let hooks = self.hooks.lock().expect("lock poisoned");
        hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered hook in order, then leave the registry empty.
    pub async fn run_all(&self) {
        let hooks = {
            #[allow(clippy::expect_used)]
            let mut hooks = self.hooks.lock().expect("lock poisoned");
            std::mem::take(&mut *hooks)
        };
        debug!("Running {} shutdown hooks", hooks.len());
        for hook in hooks {
            hook().await;
        }
    }
}
