//! A lightweight actor runtime.
//!
//! An actor owns its state exclusively and processes one message at a time,
//! so every mutation of the state is serialized without locks. Long-running
//! work is spawned as separate tasks that report back with messages.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod error;
mod handle;
mod mailbox;
mod scheduler;

pub use error::ActorDeadError;
pub use handle::{Actor, WeakActor};
pub use mailbox::Message;

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[derive(Default)]
    struct Counter {
        value: u32,
    }

    #[derive(Debug)]
    struct Add(u32);

    impl Message<Counter> for Add {
        fn handle(self, state: &mut Counter, _handle: &Actor<Counter>) {
            state.value += self.0;
        }
    }

    #[derive(Debug)]
    struct Get(oneshot::Sender<u32>);

    impl Message<Counter> for Get {
        fn handle(self, state: &mut Counter, _handle: &Actor<Counter>) {
            self.0.send(state.value).ok();
        }
    }

    /// Defers the addition through the actor's own mailbox.
    #[derive(Debug)]
    struct AddLater(u32);

    impl Message<Counter> for AddLater {
        fn handle(self, _state: &mut Counter, handle: &Actor<Counter>) {
            handle.send(Add(self.0)).ok();
        }
    }

    #[tokio::test]
    async fn test_messages_are_serialized() {
        let actor = Actor::spawn(Counter::default(), Some("counter"));
        actor.send(Add(40)).unwrap();
        actor.send(AddLater(2)).unwrap();
        actor.send(Add(0)).unwrap();

        // The deferred addition is queued behind this request.
        assert_eq!(actor.ask(Get).await.unwrap(), 40);
        assert_eq!(actor.ask(Get).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_weak_handle() {
        let actor = Actor::spawn(Counter::default(), None);
        let weak = actor.downgrade();
        assert!(weak.upgrade().is_some());

        drop(actor);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_killed_actor_rejects_ask() {
        let actor = Actor::spawn(Counter::default(), None);
        actor.try_kill();
        tokio::task::yield_now().await;
        assert!(actor.ask(Get).await.is_err());
    }
}
