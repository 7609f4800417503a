use async_trait::async_trait;

/// Implement this listener for each logical unit of work that should run while
/// master and stand down while slave.
///
/// Notifications are edge-triggered: each callback fires once per actual role
/// change, never repeatedly for consecutive identical decisions. Callbacks run
/// on the job's own election task, so long-running work should be handed off
/// rather than performed inline.
#[async_trait]
pub trait MasterSlaveListener: Send + Sync {
    /// This instance now holds mastership for the job.
    async fn go_master(&self);

    /// This instance is now a slave for the job.
    async fn go_slave(&self);
}

/// Adapter turning a pair of plain closures into a [`MasterSlaveListener`].
///
/// # Example
///
/// ```rust
/// use mastership::prelude::CallbackListener;
///
/// let listener = CallbackListener::new(
///     || println!("starting scheduled work"),
///     || println!("stopping scheduled work"),
/// );
/// ```
pub struct CallbackListener<M, S>
where
    M: Fn() + Send + Sync,
    S: Fn() + Send + Sync,
{
    on_master: M,
    on_slave: S,
}

impl<M, S> CallbackListener<M, S>
where
    M: Fn() + Send + Sync,
    S: Fn() + Send + Sync,
{
    pub fn new(on_master: M, on_slave: S) -> Self {
        Self { on_master, on_slave }
    }
}

#[async_trait]
impl<M, S> MasterSlaveListener for CallbackListener<M, S>
where
    M: Fn() + Send + Sync,
    S: Fn() + Send + Sync,
{
    async fn go_master(&self) {
        (self.on_master)();
    }

    async fn go_slave(&self) {
        (self.on_slave)();
    }
}
