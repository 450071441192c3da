//! Pure event routing and request bookkeeping for the MQTT transport
//!
//! Requests are matched to acknowledgments in two steps. When a request is
//! issued it is queued per kind; when the event loop reports the outgoing
//! packet, the oldest queued request of that kind is bound to the packet id;
//! the matching acknowledgment then resolves it. The event loop emits
//! outgoing packets in issue order, which keeps the queue and the packets
//! aligned.

use crate::error::SessionError;
use crate::session::CompletionSender;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Request types that wait for a server acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    /// QoS 1 diagnostic publish
    Ping,
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// Connection (re)established
    ConnectionAcknowledged,
    /// Value published on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// A queued request left with the given packet id
    RequestSent { kind: RequestKind, pkid: u16 },
    /// Subscribe verdict; `rejection` is set when any topic was refused
    SubscriptionAcknowledged { pkid: u16, rejection: Option<String> },
    UnsubscriptionAcknowledged { pkid: u16 },
    PublishAcknowledged { pkid: u16 },
    /// Server sent Disconnect; the next poll reports the loss
    DisconnectReceived,
    /// Our Disconnect went out
    DisconnectSent,
    /// Keep-alives and everything else we do not act on
    InfrastructureEvent(String),
}

/// Pure routing of MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    pkid: suback.pkid,
                    rejection: Self::suback_rejection(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => {
                    EventRoute::UnsubscriptionAcknowledged { pkid: unsuback.pkid }
                }
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged { pkid: puback.pkid },
                Packet::Disconnect(_) => EventRoute::DisconnectReceived,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Subscribe(pkid) => EventRoute::RequestSent {
                    kind: RequestKind::Subscribe,
                    pkid: *pkid,
                },
                Outgoing::Unsubscribe(pkid) => EventRoute::RequestSent {
                    kind: RequestKind::Unsubscribe,
                    pkid: *pkid,
                },
                Outgoing::Publish(pkid) => EventRoute::RequestSent {
                    kind: RequestKind::Ping,
                    pkid: *pkid,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
        }
    }

    /// Reason for refusal if any SubAck code is not a success (pure function)
    pub fn suback_rejection(codes: &[SubscribeReasonCode]) -> Option<String> {
        codes
            .iter()
            .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .map(|code| format!("{code:?}"))
    }
}

struct PendingRequest {
    topic: String,
    tx: CompletionSender,
}

/// Requests awaiting their packet id or their acknowledgment
#[derive(Default)]
pub struct PendingRequests {
    queued: HashMap<RequestKind, VecDeque<PendingRequest>>,
    in_flight: HashMap<(RequestKind, u16), PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request that is about to be handed to the client
    pub fn enqueue(&mut self, kind: RequestKind, topic: &str, tx: CompletionSender) {
        self.queued.entry(kind).or_default().push_back(PendingRequest {
            topic: topic.to_string(),
            tx,
        });
    }

    /// Drop the most recent queued request of `kind`; used when handing it
    /// to the client failed
    pub fn discard_last(&mut self, kind: RequestKind) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    /// Bind the oldest queued request of `kind` to `pkid`.
    /// Returns false when nothing was waiting (e.g. a resent packet).
    pub fn bind(&mut self, kind: RequestKind, pkid: u16) -> bool {
        let Some(request) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return false;
        };
        debug!(target: "mqtt_transport", ?kind, pkid, topic = %request.topic, "Request sent");
        self.in_flight.insert((kind, pkid), request);
        true
    }

    /// Resolve the request bound to `pkid`
    pub fn resolve(&mut self, kind: RequestKind, pkid: u16, rejection: Option<String>) -> bool {
        let Some(request) = self.in_flight.remove(&(kind, pkid)) else {
            debug!(target: "mqtt_transport", ?kind, pkid, "Acknowledgment for unknown request");
            return false;
        };

        let result = match rejection {
            Some(reason) => Err(SessionError::rejected(request.topic, reason)),
            None => Ok(()),
        };
        let _ = request.tx.send(result);
        true
    }

    /// Fail every outstanding request; they will not be acknowledged
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let queued = self.queued.drain().flat_map(|(_, queue)| queue);
        let in_flight = self.in_flight.drain().map(|(_, request)| request);

        let mut failed = 0;
        for request in queued.chain(in_flight) {
            let _ = request.tx.send(Err(SessionError::disconnected(reason)));
            failed += 1;
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum::<usize>() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
