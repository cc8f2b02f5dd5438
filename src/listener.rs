use crate::client::ClientHandle;
use crate::message::Message;
#[cfg(test)] use mockall::automock;

/// A capability consumer registered with a client. Every dispatched message is delivered to
///  every registered listener, in registration order.
///
/// `receive` is never invoked concurrently with itself - the dispatch loop finishes a message
///  (all listeners) before moving on to the next one.
#[cfg_attr(test, automock)]
pub trait Listener: Send + Sync + 'static {
    /// Invoked once when the listener is added, before any message is delivered. The handle can
    ///  be cloned and kept to send messages through the client.
    fn register(&mut self, client: &ClientHandle);

    fn receive(&self, message: &dyn Message, message_type: u32);
}
