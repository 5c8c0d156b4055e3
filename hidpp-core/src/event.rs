use parking_lot::Mutex;

/// A simple event emitter sending a single event to multiple MPMC channels.
#[derive(Debug)]
pub struct EventEmitter<T: Clone> {
    senders: Mutex<Vec<flume::Sender<T>>>,
}

impl<T: Clone> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Creates a new receiver and adds the corresponding sender to the sender
    /// list.
    pub fn create_receiver(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().push(tx);
        rx
    }

    /// Emits an event to all senders. Senders whose receivers were dropped are
    /// removed from the list.
    pub fn emit(&self, event: T) {
        self.senders
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_receivers_are_removed() {
        let emitter = EventEmitter::new();
        let first = emitter.create_receiver();
        let second = emitter.create_receiver();

        emitter.emit(1u8);
        drop(second);
        emitter.emit(2);

        assert_eq!(first.try_iter().collect::<Vec<_>>(), [1, 2]);
        assert_eq!(emitter.senders.lock().len(), 1);
    }
}
