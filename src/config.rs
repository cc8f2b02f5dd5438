use anyhow::bail;

pub struct NetChannelConfig {
    /// This is the maximum UDP payload size that the channel assumes, i.e. the upper bound for
    ///  a framed packet (header plus application payload). Messages that do not fit must be
    ///  fragmented by the sender; `write_header` refuses to frame them.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The channel does not attempt to discover
    ///  the MTU, so the responsibility of choosing a safe value is with the application.
    pub max_frame_size: usize,

    /// The payload size of a single fragment of a fragmented message. All fragments except the
    ///  last carry exactly this many bytes, and a fragment's offset in the reassembled message
    ///  is `fragment_index * fragment_size`.
    pub fragment_size: usize,

    /// Upper bound for the declared length of a reassembled message. Anything bigger is treated
    ///  as a protocol violation and dropped - a peer declaring a huge message must not cause a
    ///  huge allocation.
    pub max_message_size: u32,

    /// Capacity of the queue between the receive loop and the dispatch loop. When the queue is
    ///  full, the receive loop blocks until the dispatch loop catches up, bounding memory growth
    ///  under a slow consumer.
    pub queue_capacity: usize,
}

impl NetChannelConfig {
    /// IPV4 with end-to-end full Ethernet MTU, without optional headers
    pub fn default_ipv4() -> NetChannelConfig {
        NetChannelConfig {
            max_frame_size: 1472,
            fragment_size: 256,
            max_message_size: 16*1024*1024,
            queue_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_size < 100 {
            bail!("max frame size is too small");
        }
        if self.fragment_size == 0 || self.fragment_size >= self.max_frame_size {
            bail!("fragment size must be positive and leave room for a packet header inside a frame");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        Ok(())
    }
}
