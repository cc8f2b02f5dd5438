use crate::bit_buf::{BitReader, BitWriter};

/// Width of the leading message-type tag of a connectionless payload.
pub const NETMSG_TYPE_BITS: usize = 6;

/// Type tag of a disconnect notice.
pub const NETMSG_DISCONNECT: u32 = 1;

/// The message type reported to listeners for connection-bound messages, which carry no
///  self-describing type tag.
pub const MESSAGE_TYPE_QUERY: u32 = u32::MAX;

/// The capability every application message offers to the channel and the dispatch pipeline.
///
/// A message is immutable once constructed. For outbound messages, `data` is the raw payload
///  (connection-bound messages get their packet header prepended by the channel; connectionless
///  messages are sent verbatim, so their producer is responsible for any leading wire marker).
///  For inbound messages, `data` is the payload with the packet framing already stripped.
pub trait Message: Send + Sync + 'static {
    /// true = not tied to the channel's sequence/ack state
    fn is_connectionless(&self) -> bool;

    fn data(&self) -> &[u8];
}

/// A generic framed payload - both the unit the channel produces for inbound traffic and the
///  plain way to send application bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetMessage {
    connectionless: bool,
    data: Vec<u8>,
}

impl NetMessage {
    pub fn connectionless(data: Vec<u8>) -> NetMessage {
        NetMessage {
            connectionless: true,
            data,
        }
    }

    /// A connection-bound message, delivery tracked via sequence/ack state.
    pub fn reliable(data: Vec<u8>) -> NetMessage {
        NetMessage {
            connectionless: false,
            data,
        }
    }

    /// The type under which this message is dispatched to listeners: the leading
    ///  [NETMSG_TYPE_BITS]-wide tag for connectionless messages, [MESSAGE_TYPE_QUERY] otherwise.
    pub fn message_type(&self) -> anyhow::Result<u32> {
        if self.connectionless {
            BitReader::new(&self.data).read_bits(NETMSG_TYPE_BITS)
        }
        else {
            Ok(MESSAGE_TYPE_QUERY)
        }
    }
}

impl Message for NetMessage {
    fn is_connectionless(&self) -> bool {
        self.connectionless
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// The protocol-level disconnect notice: the 6-bit tag [NETMSG_DISCONNECT] followed by a
///  NUL-terminated reason, all through the bit cursor.
pub struct DisconnectMessage {
    buf: Vec<u8>,
}

impl DisconnectMessage {
    pub fn new(reason: &str) -> DisconnectMessage {
        let mut writer = BitWriter::new();
        writer.write_bits(NETMSG_DISCONNECT, NETMSG_TYPE_BITS);
        writer.write_cstr(reason);

        DisconnectMessage {
            buf: writer.into_bytes(),
        }
    }
}

impl Message for DisconnectMessage {
    fn is_connectionless(&self) -> bool {
        false
    }

    fn data(&self) -> &[u8] {
        &self.buf
    }
}
