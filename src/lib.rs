//! An asynchronous client for a multiplayer game protocol on top of unreliable datagrams,
//!  maintaining a logical channel that provides ordered delivery semantics, reassembly of
//!  messages split across packets, and dispatch of decoded messages to registered listeners.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes)
//! * Prioritise freshness over completeness: packets have sequence numbers, and a packet
//!   arriving behind the newest accepted one is dropped rather than reordered - a game
//!   client wants the current state, not a replay of stale state
//! * Big messages are split into fragments by the sender and reassembled by the receiver,
//!   with two independent subchannel slots so two large messages can be in flight at once
//! * Out-of-band traffic is supported via *connectionless* messages that bypass sequence
//!   tracking entirely and self-describe through a leading bit-packed type tag
//! * Receiving and dispatching run as two supervised background loops coupled by a bounded
//!   queue: every decoded message is dispatched to every registered listener exactly once,
//!   a slow listener applies backpressure instead of growing memory, and a dead loop is
//!   reported instead of silently vanishing
//! * Cancellation is cooperative but has bounded latency: both loops race their blocking
//!   operation against a shared cancellation token
//!
//! ## Wire format
//!
//! Connection-bound packet (all numbers in network byte order):
//! ```ascii
//! 0:  sequence (u32) - the sender's outgoing sequence number, starting at 1. The value
//!      FFFFFFFF is reserved as the connectionless marker and is never a valid sequence.
//! 4:  acked sequence (u32) - the highest incoming sequence the sender had accepted when
//!      this packet was framed
//! 8:  flags (u8):
//!      * 0x01 RELIABLE        - delivery is sequence/ack tracked
//!      * 0x02 FRAGMENTED      - a fragment descriptor follows
//!      * 0x04 SUBCHANNEL_ACK  - a subchannel ack byte follows
//! 9:  subchannel ack bits (u8, present iff SUBCHANNEL_ACK): bit i set iff the sender's
//!      subchannel i holds an incomplete in-progress message. Piggybacked on outgoing
//!      traffic so the peer can re-send what is missing.
//! *:  fragment descriptor (present iff FRAGMENTED):
//!      * subchannel index (u8): 0 or 1
//!      * message id (u32): identifies the fragmented message within its subchannel
//!      * total length (u32): byte length of the complete message
//!      * fragment index (u16)
//!      * fragment count (u16)
//! *:  payload bytes
//! ```
//!
//! Connectionless packet:
//! ```ascii
//! 0: FFFFFFFF (u32) - connectionless marker
//! 4: payload, beginning with a 6-bit message-type tag packed most-significant-bit-first
//! ```
//!
//! A fragment with index `i` covers bytes `[i * fragment_size, i * fragment_size + len)` of
//!  the reassembled message; all fragments except the last carry exactly `fragment_size`
//!  bytes.

pub mod bit_buf;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod listener;
pub mod message;
pub mod packet_header;
pub mod subchannel;
