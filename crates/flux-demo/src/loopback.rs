//! In-memory transport connecting the simulated peers.
//!
//! Reliable messages arrive on the next tick in send order. Unreliable
//! messages are held back by a varying number of ticks so entity frames
//! arrive out of order, as they would over a lossy link.

use flux_actions::PeerId;
use flux_net::{Channel, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Peer(PeerId),
    Broadcast,
}

/// Messages a node sent during one tick.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<(Destination, Channel, Vec<u8>)>,
}

impl Transport for Outbox {
    fn send_to_peer(&mut self, peer: &PeerId, channel: Channel, bytes: Vec<u8>) {
        self.messages
            .push((Destination::Peer(peer.clone()), channel, bytes));
    }

    fn broadcast(&mut self, channel: Channel, bytes: Vec<u8>) {
        self.messages.push((Destination::Broadcast, channel, bytes));
    }
}

impl Outbox {
    pub fn take(&mut self) -> Vec<(Destination, Channel, Vec<u8>)> {
        std::mem::take(&mut self.messages)
    }
}

/// A message handed to its recipient.
#[derive(Debug)]
pub struct Delivery {
    pub from: PeerId,
    pub to: PeerId,
    pub channel: Channel,
    pub bytes: Vec<u8>,
}

struct InFlight {
    deliver_at: u32,
    delivery: Delivery,
}

#[derive(Default)]
pub struct LoopbackHub {
    in_flight: Vec<InFlight>,
    sent: u64,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes everything in `outbox` and schedules it for `members`.
    /// Broadcasts go to every member except the sender.
    pub fn collect(&mut self, tick: u32, from: &PeerId, outbox: &mut Outbox, members: &[PeerId]) {
        for (destination, channel, bytes) in outbox.take() {
            let recipients: Vec<&PeerId> = match &destination {
                Destination::Peer(peer) => members.iter().filter(|member| *member == peer).collect(),
                Destination::Broadcast => members.iter().filter(|member| *member != from).collect(),
            };
            for to in recipients {
                self.sent += 1;
                let delay = match channel {
                    Channel::Reliable => 1,
                    Channel::Unreliable => 1 + (self.sent % 3) as u32,
                };
                self.in_flight.push(InFlight {
                    deliver_at: tick + delay,
                    delivery: Delivery {
                        from: from.clone(),
                        to: to.clone(),
                        channel,
                        bytes: bytes.clone(),
                    },
                });
            }
        }
    }

    /// Messages due at `tick`, in send order.
    pub fn due(&mut self, tick: u32) -> Vec<Delivery> {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|message| message.deliver_at <= tick);
        self.in_flight = pending;
        due.into_iter().map(|message| message.delivery).collect()
    }

    /// Drops everything addressed to or sent by a departed peer.
    pub fn disconnect(&mut self, peer: &PeerId) {
        self.in_flight
            .retain(|message| &message.delivery.to != peer && &message.delivery.from != peer);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
