use crate::config::NetChannelConfig;
use crate::packet_header::FragmentDescriptor;
use anyhow::bail;
use bit_set::BitSet;
use tracing::{debug, trace};

/// One of the two independent fragment-reassembly slots of a channel.
///
/// A slot is `Idle` until the first fragment of a new message arrives, then collects fragments
///  in any arrival order until all of them landed, at which point the assembled buffer is moved
///  out and the slot resets to `Idle`.
///
/// A fragment carrying a *new* message id while an assembly is in progress supersedes it: the
///  partial buffer is discarded and the slot starts over with the new message. A fragment whose
///  descriptor disagrees with the in-progress message it claims to belong to is rejected without
///  touching the slot.
pub struct Subchannel {
    state: SubchannelState,
}

enum SubchannelState {
    Idle,
    AwaitingFragments {
        message_id: u32,
        total_length: usize,
        fragment_count: usize,
        received: BitSet,
        assembly_buffer: Vec<u8>,
    },
}

impl Subchannel {
    pub fn new() -> Subchannel {
        Subchannel {
            state: SubchannelState::Idle,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, SubchannelState::AwaitingFragments { .. })
    }

    /// Route one fragment into the slot. Returns the fully reassembled message once the last
    ///  outstanding fragment lands; the slot is `Idle` again afterwards.
    ///
    /// All validation happens before any slot mutation, so an `Err` leaves the assembly intact.
    pub fn on_fragment(&mut self, descriptor: &FragmentDescriptor, payload: &[u8], config: &NetChannelConfig) -> anyhow::Result<Option<Vec<u8>>> {
        let total_length = descriptor.total_length as usize;
        let fragment_count = descriptor.fragment_count as usize;
        let fragment_index = descriptor.fragment_index as usize;

        if descriptor.total_length == 0 || descriptor.total_length > config.max_message_size {
            bail!("declared message length {} is outside (0, {}]", descriptor.total_length, config.max_message_size);
        }
        if fragment_index >= fragment_count {
            bail!("fragment index {} out of range for a message of {} fragments", fragment_index, fragment_count);
        }
        if fragment_count != total_length.div_ceil(config.fragment_size) {
            bail!("fragment count {} is inconsistent with declared message length {}", fragment_count, total_length);
        }

        let offset = fragment_index * config.fragment_size;
        let is_last = fragment_index + 1 == fragment_count;
        let expected_len = if is_last { total_length - offset } else { config.fragment_size };
        if payload.len() != expected_len {
            bail!("fragment {}/{} has length {}, expected {}", fragment_index, fragment_count, payload.len(), expected_len);
        }

        let starts_new_message = match &self.state {
            SubchannelState::Idle => true,
            SubchannelState::AwaitingFragments { message_id, total_length: in_progress_total, fragment_count: in_progress_count, .. } => {
                if *message_id == descriptor.message_id {
                    if *in_progress_total != total_length || *in_progress_count != fragment_count {
                        bail!("fragment descriptor for message {} disagrees with the in-progress assembly", descriptor.message_id);
                    }
                    false
                }
                else {
                    debug!("fragment for new message {} supersedes incomplete message {} - discarding partial assembly", descriptor.message_id, message_id);
                    true
                }
            }
        };

        if starts_new_message {
            self.state = SubchannelState::AwaitingFragments {
                message_id: descriptor.message_id,
                total_length,
                fragment_count,
                received: BitSet::with_capacity(fragment_count),
                assembly_buffer: vec![0; total_length],
            };
        }

        match &mut self.state {
            SubchannelState::AwaitingFragments { received, assembly_buffer, .. } => {
                if received.contains(fragment_index) {
                    trace!("duplicate fragment {} for message {} - ignoring", fragment_index, descriptor.message_id);
                    return Ok(None);
                }
                assembly_buffer[offset..offset + payload.len()].copy_from_slice(payload);
                received.insert(fragment_index);

                if received.len() < fragment_count {
                    return Ok(None);
                }
            }
            SubchannelState::Idle => unreachable!("slot was just initialized"),
        }

        match std::mem::replace(&mut self.state, SubchannelState::Idle) {
            SubchannelState::AwaitingFragments { assembly_buffer, message_id, .. } => {
                trace!("message {} completely reassembled ({} bytes)", message_id, assembly_buffer.len());
                Ok(Some(assembly_buffer))
            }
            SubchannelState::Idle => unreachable!("slot was just initialized"),
        }
    }
}
