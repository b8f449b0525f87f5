//! Event routing.
//!
//! [`route`] is a pure mapping from (sender, inbound event) to a target and
//! the forwarded message. [`Dispatcher`] performs the delivery against the
//! directory.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use super::connection::ClientConnection;
use super::directory::RelayDirectory;
use super::identity::Identity;
use super::protocol::{self, InboundMessage, OutboundMessage};
use crate::metrics::{
    RELAY_DELIVERIES_TOTAL, RELAY_DELIVERY_FAILURES_TOTAL, RELAY_ROUTING_MISSES_TOTAL,
};

/// Where a forwarded message goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Back to the connection that sent the inbound frame only.
    Origin,
    /// Every connection in the identity's mailbox.
    Mailbox(Identity),
}

/// One routing decision.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// Recipient set.
    pub target: Target,
    /// Message to write to each recipient.
    pub message: OutboundMessage,
}

/// Apply the relabeling rules for one inbound event.
pub fn route(sender: &Identity, inbound: InboundMessage) -> Delivery {
    match inbound {
        InboundMessage::Ping { data } => Delivery {
            target: Target::Origin,
            message: OutboundMessage::Pong(data),
        },
        InboundMessage::Call {
            callee_id,
            rtc_message,
        } => Delivery {
            target: Target::Mailbox(callee_id),
            message: OutboundMessage::NewCall {
                caller_id: sender.clone(),
                rtc_message,
            },
        },
        InboundMessage::AnswerCall {
            caller_id,
            rtc_message,
        } => Delivery {
            target: Target::Mailbox(caller_id),
            message: OutboundMessage::CallAnswered {
                callee: sender.clone(),
                rtc_message,
            },
        },
        InboundMessage::CallEnding { caller_id } => Delivery {
            target: Target::Mailbox(caller_id),
            message: OutboundMessage::CallEnd {},
        },
        InboundMessage::IceCandidate {
            callee_id,
            rtc_message,
        } => Delivery {
            target: Target::Mailbox(callee_id),
            message: OutboundMessage::IceCandidate {
                sender: sender.clone(),
                rtc_message,
            },
        },
    }
}

/// Outcome of one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Connections the message was addressed to.
    pub recipients: usize,
    /// Connections whose queue accepted the frame.
    pub delivered: usize,
}

/// Delivers routed messages to mailbox members.
#[derive(Clone)]
pub struct Dispatcher {
    directory: Arc<RelayDirectory>,
}

impl Dispatcher {
    /// Create a dispatcher over `directory`.
    pub fn new(directory: Arc<RelayDirectory>) -> Self {
        Self { directory }
    }

    /// Route `inbound` from `sender` (arriving on `origin`) and deliver it.
    pub fn dispatch(
        &self,
        origin: &ClientConnection,
        sender: &Identity,
        inbound: InboundMessage,
    ) -> DispatchReport {
        let Delivery { target, message } = route(sender, inbound);
        let event = message.event_name();

        let frame = match protocol::encode(&message) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(event, error = %e, "failed to serialize outbound message");
                return DispatchReport::default();
            }
        };

        match target {
            Target::Origin => {
                let delivered = usize::from(origin.send(frame));
                if delivered == 0 {
                    warn!(conn_id = %origin.id, event, "failed to enqueue reply");
                }
                record(1, delivered);
                DispatchReport {
                    recipients: 1,
                    delivered,
                }
            }
            Target::Mailbox(identity) => {
                // Snapshot first; no directory lock is held while enqueueing.
                let members = self.directory.mailbox(&identity);
                if members.is_empty() {
                    debug!(target_identity = %identity, event, "no recipients, dropping");
                    counter!(RELAY_ROUTING_MISSES_TOTAL).increment(1);
                    return DispatchReport::default();
                }
                let mut delivered = 0;
                for member in &members {
                    if member.send(Arc::clone(&frame)) {
                        delivered += 1;
                    } else {
                        warn!(
                            conn_id = %member.id,
                            target_identity = %identity,
                            event,
                            "failed to enqueue forwarded message"
                        );
                    }
                }
                debug!(
                    from = %sender,
                    target_identity = %identity,
                    event,
                    recipients = members.len(),
                    delivered,
                    "forwarded"
                );
                record(members.len(), delivered);
                DispatchReport {
                    recipients: members.len(),
                    delivered,
                }
            }
        }
    }
}

fn record(recipients: usize, delivered: usize) {
    counter!(RELAY_DELIVERIES_TOTAL).increment(delivered as u64);
    counter!(RELAY_DELIVERY_FAILURES_TOTAL).increment((recipients - delivered) as u64);
}
