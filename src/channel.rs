use crate::config::NetChannelConfig;
use crate::message::{Message, NetMessage};
use crate::packet_header::PacketHeader;
use crate::subchannel::Subchannel;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace};

pub const NUM_SUBCHANNELS: usize = 2;

/// The stateful protocol engine mediating between raw packets and complete application messages
///  for one connection.
///
/// Inbound, it consumes raw datagrams and produces fully reassembled messages: sequenced
///  packets are checked against the accepted incoming sequence (stale and duplicate packets are
///  dropped), fragments are routed into one of two independent subchannel slots, and everything
///  that became complete is buffered until [Channel::take_messages] drains it. Outbound, it
///  frames connection-bound messages with a packet header, advancing the outgoing sequence by
///  exactly one per framed packet.
///
/// The channel is purely a state machine - it does no I/O and is driven entirely by its caller.
pub struct Channel {
    config: Arc<NetChannelConfig>,
    /// sequence number of the last framed outgoing packet; 0 = nothing sent yet
    outgoing_sequence: u32,
    /// highest accepted incoming sequence number; 0 = nothing accepted yet
    incoming_sequence: u32,
    subchannels: [Subchannel; NUM_SUBCHANNELS],
    ready: Vec<NetMessage>,
}

impl Channel {
    pub fn new(config: Arc<NetChannelConfig>) -> Channel {
        Channel {
            config,
            outgoing_sequence: 0,
            incoming_sequence: 0,
            subchannels: [Subchannel::new(), Subchannel::new()],
            ready: Vec::new(),
        }
    }

    /// Frame a connection-bound message: prepend a packet header carrying the next outgoing
    ///  sequence number and the sequence being acknowledged, and (if `has_subchannel_data`)
    ///  the piggybacked subchannel ack bits.
    ///
    /// Returns `None` if header plus payload do not fit into a frame - the message is not sent
    ///  and the sequence counter does not advance.
    pub fn write_header(&mut self, message: &dyn Message, has_subchannel_data: bool) -> Option<NetMessage> {
        let mut header = PacketHeader::new(self.outgoing_sequence + 1, self.incoming_sequence);
        if has_subchannel_data {
            header = header.with_subchannel_ack(self.subchannel_ack_bits());
        }

        if header.serialized_len() + message.data().len() > self.config.max_frame_size {
            debug!("message of length {} does not fit into a frame of at most {} bytes - not framing", message.data().len(), self.config.max_frame_size);
            return None;
        }
        self.outgoing_sequence += 1;

        let mut buf = BytesMut::with_capacity(header.serialized_len() + message.data().len());
        header.ser(&mut buf);
        buf.put_slice(message.data());

        trace!("framed packet #{} acking #{} with {} payload bytes", self.outgoing_sequence, self.incoming_sequence, message.data().len());
        Some(NetMessage::reliable(buf.to_vec()))
    }

    /// Decode one raw datagram and fold it into the channel state.
    ///
    /// `Err` means the packet was malformed (truncated header, undefined flag bits, inconsistent
    ///  fragment descriptor); sequence/ack state is left unchanged in that case and the caller is
    ///  expected to drop the packet and carry on. Stale and duplicate sequenced packets are not
    ///  an error - they are discarded silently with no state mutation.
    pub fn process_packet(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        let mut buf: &[u8] = raw;

        let sequence = buf.try_get_u32()?;
        if sequence == PacketHeader::CONNECTIONLESS_SEQUENCE {
            trace!("received connectionless packet with {} payload bytes", buf.len());
            self.ready.push(NetMessage::connectionless(buf.to_vec()));
            return Ok(());
        }

        let mut buf: &[u8] = raw;
        let header = PacketHeader::deser(&mut buf)?;

        if header.sequence <= self.incoming_sequence {
            debug!("packet #{} is at or below the accepted incoming sequence #{} - dropping as stale", header.sequence, self.incoming_sequence);
            return Ok(());
        }

        if let Some(descriptor) = &header.fragment {
            // subchannel index was validated during header parsing
            let completed = self.subchannels[descriptor.subchannel as usize]
                .on_fragment(descriptor, buf, &self.config)?;
            if let Some(assembled) = completed {
                self.ready.push(NetMessage::reliable(assembled));
            }
        }
        else if !buf.is_empty() {
            self.ready.push(NetMessage::reliable(buf.to_vec()));
        }

        // only fully processed packets advance the sequence, so a malformed fragment above
        //  leaves the channel as if the packet never arrived
        self.incoming_sequence = header.sequence;
        trace!("accepted packet #{}", header.sequence);
        Ok(())
    }

    /// true iff at least one subchannel holds an incomplete in-progress message. The caller is
    ///  expected to solicit the missing fragments, e.g. by sending a packet with piggybacked
    ///  subchannel ack bits.
    pub fn waiting_on_fragments(&self) -> bool {
        self.subchannels.iter().any(|s| s.is_waiting())
    }

    /// bit i set iff subchannel i is mid-assembly
    pub fn subchannel_ack_bits(&self) -> u8 {
        self.subchannels.iter().enumerate()
            .filter(|(_, s)| s.is_waiting())
            .fold(0, |bits, (i, _)| bits | (1 << i))
    }

    /// Drain all messages that became ready since the last call, in the order they became
    ///  ready. This is a one-shot drain: calling it again before new packets arrive returns
    ///  an empty sequence.
    pub fn take_messages(&mut self) -> Vec<NetMessage> {
        std::mem::take(&mut self.ready)
    }
}
