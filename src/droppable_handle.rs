use tokio::task::JoinHandle;

// Background task that lives exactly as long as its owner.
#[derive(Debug)]
pub(crate) struct DroppableHandle<T>(JoinHandle<T>);

impl<T: Send + 'static> DroppableHandle<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        DroppableHandle(tokio::spawn(future))
    }
}

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
