//! The single event-loop task behind a [`Connection`](crate::Connection).
//!
//! One reactor owns the trunk transport outright: nothing else reads or
//! writes it. Everything other tasks want sent is funneled through the
//! outbound channel (the in-process forwarding leg), and reply registrations
//! arrive on a control channel that is drained ahead of I/O, so a reply can
//! never race past its registration.
//!
//! Inbound frames resolve in a fixed order: the reply table by correlation id
//! first (so streaming replies never look like unsolicited commands), then
//! the command table. Command handlers are synchronous closures invoked right
//! here on the reactor task; they update resource state and release latches
//! but cannot suspend, which is also what makes a blocking send from inside a
//! handler unrepresentable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use berth_wire::{Message, SecureTransport, WireError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::Error;

/// A dispatch cycle slower than this gets flagged.
const STALL_WARNING: Duration = Duration::from_millis(100);

/// A synchronous frame handler run on the reactor task.
pub(crate) type FrameFn = Box<dyn FnMut(&Message) + Send>;

/// Where frames carrying a registered correlation id go.
pub(crate) enum ReplySink {
    /// One reply releases one parked sender.
    Once(oneshot::Sender<Message>),
    /// Many frames until the `no_more_replies` sentinel, which is delivered
    /// and then unregisters the route.
    Stream(FrameFn),
}

/// An entry in the statically-declared command table.
pub(crate) struct CommandHandler {
    pub handler: FrameFn,
    pub required: &'static [&'static str],
    pub needs_reply: bool,
}

pub(crate) enum Control {
    Register { id: String, sink: ReplySink },
    Unregister { id: String },
    Stop,
}

pub(crate) struct Reactor {
    pub transport: SecureTransport<TcpStream>,
    pub outbound: mpsc::UnboundedReceiver<Message>,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub commands: HashMap<&'static str, CommandHandler>,
    pub replies: HashMap<String, ReplySink>,
    pub on_dispatch_error: Option<Box<dyn FnMut(Error, &Message) + Send>>,
    pub on_shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl Reactor {
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                ctrl = self.control.recv() => match ctrl {
                    None | Some(Control::Stop) => break,
                    Some(Control::Register { id, sink }) => {
                        debug!("registered a reply route for: {id}");
                        self.replies.insert(id, sink);
                    }
                    Some(Control::Unregister { id }) => {
                        if self.replies.remove(&id).is_none() {
                            debug!("unregister for a correlation id that isn't hooked: {id}");
                        }
                    }
                },

                outgoing = self.outbound.recv() => match outgoing {
                    None => break,
                    Some(msg) => {
                        if let Err(err) = self.transport.send(&msg).await {
                            error!("trunk send failed: {err}");
                            break;
                        }
                    }
                },

                frame = self.transport.recv() => {
                    let started = Instant::now();
                    match frame {
                        Ok(msg) => {
                            if !self.dispatch(msg) {
                                break;
                            }
                        }
                        Err(WireError::Closed) => {
                            info!("broker closed the connection");
                            break;
                        }
                        Err(err) => {
                            error!("trunk receive failed: {err}");
                            break;
                        }
                    }
                    let elapsed = started.elapsed();
                    if elapsed > STALL_WARNING {
                        warn!("event loop stalled for {}ms", elapsed.as_millis());
                    }
                },
            }
        }

        // Dropping the reply table cancels every parked oneshot, so pending
        // blocking calls fail with Disconnected rather than hanging.
        self.replies.clear();
        if let Some(on_shutdown) = self.on_shutdown.take() {
            on_shutdown();
        }
        debug!("event loop has finished");
    }

    /// Route one inbound frame. Returns false when the failure is fatal for
    /// the session.
    fn dispatch(&mut self, msg: Message) -> bool {
        // An exception is logged on arrival; it is additionally re-raised on
        // whichever waiter owns the correlation id, below.
        if let Some(exception) = msg.exception() {
            error!("broker exception: {exception}");
        }

        // Hooked reply? Checked before command dispatch.
        if !msg.id.is_empty() && self.replies.contains_key(&msg.id) {
            match self.replies.remove(&msg.id).expect("checked above") {
                ReplySink::Once(tx) => {
                    let _ = tx.send(msg);
                }
                ReplySink::Stream(mut handler) => {
                    handler(&msg);
                    if !msg.is_sentinel() {
                        // Still streaming: put the route back.
                        self.replies.insert(msg.id.clone(), ReplySink::Stream(handler));
                    } else {
                        debug!("streaming reply finished: {}", msg.id);
                    }
                }
            }
            return true;
        }

        // A vanilla command, hopefully.
        let Some(entry) = self.commands.get_mut(msg.command.as_str()) else {
            warn!("no handler was found for: {}", msg.command);
            return true;
        };
        if let Err(problem) = check_basic_properties(&msg, entry) {
            let err = Error::State(problem);
            error!("bad {} frame: {err}", msg.command);
            return match self.on_dispatch_error.as_mut() {
                Some(callback) => {
                    callback(err, &msg);
                    true
                }
                // No error callback: fatal for the session.
                None => false,
            };
        }
        (entry.handler)(&msg);
        true
    }
}

/// Bounce missing properties before a handler trips over them.
fn check_basic_properties(msg: &Message, entry: &CommandHandler) -> Result<(), String> {
    for necessary in entry.required {
        if msg.params.get(necessary).is_none() {
            return Err(format!("necessary parameter was not passed: {necessary}"));
        }
    }
    if entry.needs_reply && !msg.replyable() {
        return Err("this command needs to be replyable but the message was not".into());
    }
    Ok(())
}
