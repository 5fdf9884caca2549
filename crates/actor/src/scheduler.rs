use std::sync::Weak;

use tokio::select;
use tokio::sync::watch;

use crate::{Actor, Message};
use crate::mailbox::{Mailbox, MessageRx};

/// Runs the message loop of one actor until it is killed or every strong
/// handle is gone.
pub async fn run_actor<S: Send + Sync + 'static>(
    mailbox: Weak<Mailbox<S>>,
    mut state: S,
    mut msg_rx: MessageRx<S>,
    mut kill_rx: watch::Receiver<bool>,
) {
    debug!("started");
    let mut handled: u64 = 0;
    loop {
        let msg = select! {
            biased;

            _ = kill_rx.changed() => break,
            msg = msg_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        trace!("received message: {msg:?}");

        // Handlers get a strong handle for the duration of the call only,
        // otherwise the actor would keep itself alive.
        let Some(mailbox) = mailbox.upgrade() else {
            debug!("all handles dropped, discarding {msg:?}");
            break;
        };
        trace_span!("proc msg").in_scope(|| {
            msg.handle(&mut state, &Actor::from_mailbox(mailbox));
        });
        handled += 1;
    }
    debug!(handled, "will terminate");
}
