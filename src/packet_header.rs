use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        /// delivery of this packet is sequence/ack tracked
        const RELIABLE = 0x01;
        /// a fragment descriptor follows the flag byte
        const FRAGMENTED = 0x02;
        /// a subchannel ack byte follows the flag byte
        const SUBCHANNEL_ACK = 0x04;
    }
}

/// Header of a connection-bound packet.
///
/// Wire layout (all numbers BE):
/// ```ascii
/// 0: sequence (u32) - FFFFFFFF is the connectionless marker, never a valid sequence
/// 4: acked sequence (u32)
/// 8: flags (u8)
/// 9: subchannel ack bits (u8) - present iff SUBCHANNEL_ACK
/// *: fragment descriptor - present iff FRAGMENTED
/// *: payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub ack: u32,
    pub flags: PacketFlags,
    /// bit i is set iff the sender's subchannel i holds an incomplete in-progress message
    pub subchannel_ack_bits: Option<u8>,
    pub fragment: Option<FragmentDescriptor>,
}

impl PacketHeader {
    /// Sequence value marking a packet as connectionless. Checked by the channel before header
    ///  parsing, so a regular header never carries it.
    pub const CONNECTIONLESS_SEQUENCE: u32 = u32::MAX;

    pub const MIN_SERIALIZED_LEN: usize = 2 * size_of::<u32>() + 1;

    pub fn new(sequence: u32, ack: u32) -> PacketHeader {
        PacketHeader {
            sequence,
            ack,
            flags: PacketFlags::RELIABLE,
            subchannel_ack_bits: None,
            fragment: None,
        }
    }

    pub fn with_subchannel_ack(mut self, bits: u8) -> PacketHeader {
        self.flags |= PacketFlags::SUBCHANNEL_ACK;
        self.subchannel_ack_bits = Some(bits);
        self
    }

    pub fn with_fragment(mut self, fragment: FragmentDescriptor) -> PacketHeader {
        self.flags |= PacketFlags::FRAGMENTED;
        self.fragment = Some(fragment);
        self
    }

    pub fn serialized_len(&self) -> usize {
        let mut len = Self::MIN_SERIALIZED_LEN;
        if self.subchannel_ack_bits.is_some() {
            len += 1;
        }
        if self.fragment.is_some() {
            len += FragmentDescriptor::SERIALIZED_LEN;
        }
        len
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sequence);
        buf.put_u32(self.ack);
        buf.put_u8(self.flags.bits());
        if let Some(bits) = self.subchannel_ack_bits {
            buf.put_u8(bits);
        }
        if let Some(fragment) = &self.fragment {
            fragment.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let sequence = buf.try_get_u32()?;
        if sequence == Self::CONNECTIONLESS_SEQUENCE {
            bail!("connectionless marker is not a valid packet sequence");
        }
        let ack = buf.try_get_u32()?;

        let raw_flags = buf.try_get_u8()?;
        let flags = match PacketFlags::from_bits(raw_flags) {
            Some(flags) => flags,
            None => bail!("packet has undefined flag bits: {:02x}", raw_flags),
        };

        let subchannel_ack_bits = if flags.contains(PacketFlags::SUBCHANNEL_ACK) {
            Some(buf.try_get_u8()?)
        }
        else {
            None
        };

        let fragment = if flags.contains(PacketFlags::FRAGMENTED) {
            Some(FragmentDescriptor::deser(buf)?)
        }
        else {
            None
        };

        Ok(PacketHeader {
            sequence,
            ack,
            flags,
            subchannel_ack_bits,
            fragment,
        })
    }
}

/// Where a fragment belongs: which subchannel slot reassembles it, which message it is part of,
///  and its place in that message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentDescriptor {
    /// 0 or 1
    pub subchannel: u8,
    /// identifies the fragmented message within its subchannel
    pub message_id: u32,
    /// byte length of the complete message
    pub total_length: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
}

impl FragmentDescriptor {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + 2 * size_of::<u32>() + 2 * size_of::<u16>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.subchannel);
        buf.put_u32(self.message_id);
        buf.put_u32(self.total_length);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_count);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentDescriptor> {
        let subchannel = buf.try_get_u8()?;
        if subchannel > 1 {
            bail!("subchannel index out of range: {}", subchannel);
        }

        Ok(FragmentDescriptor {
            subchannel,
            message_id: buf.try_get_u32()?,
            total_length: buf.try_get_u32()?,
            fragment_index: buf.try_get_u16()?,
            fragment_count: buf.try_get_u16()?,
        })
    }
}
