use crate::channel::Channel;
use crate::config::NetChannelConfig;
use crate::connection::{Connection, UdpConnection};
use crate::listener::Listener;
use crate::message::{Message, NetMessage};
use anyhow::{anyhow, bail};
use std::future::Future;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Terminal failure of a background task. Transport failures and panics in the receive or
///  dispatch loop are converted into this and delivered through the receiver obtained from
///  [NetClient::take_faults], so the owner can react (reconnect, shut down) instead of being
///  left with a silently dead pipeline.
#[derive(Debug)]
pub struct TaskFault {
    pub task: &'static str,
    pub error: anyhow::Error,
}

/// A cheap clone of the client's sending half: the channel state plus the connection slot.
///
/// This is what listeners get at registration time so they can send through the client, and it
///  is the reason `send_message` is safe to call concurrently with the background loops - all
///  channel mutation goes through the one mutex in here.
#[derive(Clone)]
pub struct ClientHandle {
    config: Arc<NetChannelConfig>,
    channel: Arc<Mutex<Channel>>,
    connection: Arc<RwLock<Option<Arc<dyn Connection>>>>,
}

impl ClientHandle {
    /// Send a message to the connected peer. Connection-bound messages are framed by the
    ///  channel first; connectionless messages go out verbatim.
    ///
    /// Returns `Ok(false)` if framing failed (message too big for a frame) - nothing is sent
    ///  and the channel's outgoing sequence does not advance. Transport failures are `Err`.
    pub async fn send_message(&self, message: &dyn Message, has_subchannel_data: bool) -> anyhow::Result<bool> {
        let connection = match self.connection.read().await.clone() {
            Some(connection) => connection,
            None => bail!("not connected"),
        };

        let packet_buf = if message.is_connectionless() {
            message.data().to_vec()
        }
        else {
            match self.channel.lock().await.write_header(message, has_subchannel_data) {
                Some(framed) => framed.data().to_vec(),
                None => return Ok(false),
            }
        };

        connection.send(&packet_buf).await?;
        Ok(true)
    }
}

/// The client orchestrator: owns one connection and one channel, runs the receive and dispatch
///  loops, and routes every decoded message to every registered listener exactly once.
///
/// The two loops are coupled by a bounded queue: the receive loop is the sole producer, the
///  dispatch loop the sole consumer, so dequeueing is inherently exactly-once and the receive
///  loop blocks (rather than growing memory) when the consumer falls behind. Both loops race
///  every blocking operation against a shared cancellation token, so cancellation latency is
///  bounded by one in-flight operation.
pub struct NetClient {
    handle: ClientHandle,
    listeners: Arc<RwLock<Vec<Box<dyn Listener>>>>,
    cancel_token: CancellationToken,
    receive_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
    fault_tx: mpsc::Sender<TaskFault>,
    fault_rx: Option<mpsc::Receiver<TaskFault>>,
}

impl NetClient {
    pub fn new(config: NetChannelConfig) -> anyhow::Result<NetClient> {
        config.validate()?;
        let config = Arc::new(config);
        let (fault_tx, fault_rx) = mpsc::channel(4);

        Ok(NetClient {
            handle: ClientHandle {
                config: config.clone(),
                channel: Arc::new(Mutex::new(Channel::new(config))),
                connection: Arc::new(RwLock::new(None)),
            },
            listeners: Arc::new(RwLock::new(Vec::new())),
            cancel_token: CancellationToken::new(),
            receive_task: None,
            dispatch_task: None,
            fault_tx,
            fault_rx: Some(fault_rx),
        })
    }

    /// The receiver for terminal background-task failures. There is one receiver; the first
    ///  caller gets it.
    pub fn take_faults(&mut self) -> Option<mpsc::Receiver<TaskFault>> {
        self.fault_rx.take()
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Open a UDP transport to the peer and start the receive and dispatch loops. Returns as
    ///  soon as the loops are running - it does not wait for any traffic.
    pub async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        let connection = UdpConnection::connect(host, port, &self.handle.config).await?;
        self.connect_with(Arc::new(connection)).await
    }

    /// Like [NetClient::connect], but on a caller-provided transport.
    pub async fn connect_with(&mut self, connection: Arc<dyn Connection>) -> anyhow::Result<()> {
        {
            let mut slot = self.handle.connection.write().await;
            if slot.is_some() {
                bail!("already connected");
            }
            *slot = Some(connection.clone());
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.handle.config.queue_capacity);

        self.receive_task = Some(Self::spawn_supervised(
            "receive",
            self.fault_tx.clone(),
            Self::receive_loop(self.handle.clone(), connection, queue_tx, self.cancel_token.clone()),
        ));
        self.dispatch_task = Some(Self::spawn_supervised(
            "dispatch",
            self.fault_tx.clone(),
            Self::dispatch_loop(self.listeners.clone(), queue_rx, self.cancel_token.clone()),
        ));
        Ok(())
    }

    /// Register a listener. Its `register` hook runs first (so it can keep a [ClientHandle]),
    ///  then it is appended to the registry and sees every subsequently dispatched message.
    pub async fn add_listener(&self, mut listener: Box<dyn Listener>) {
        listener.register(&self.handle);
        self.listeners.write().await.push(listener);
    }

    pub async fn send_message(&self, message: &dyn Message, has_subchannel_data: bool) -> anyhow::Result<bool> {
        self.handle.send_message(message, has_subchannel_data).await
    }

    /// Shut the client down: an optional disconnect notice is sent first, then both background
    ///  loops are cancelled, then the transport is closed, then the loops are joined. A loop
    ///  that panicked surfaces as a [TaskFault] rather than vanishing.
    pub async fn disconnect(&mut self, message: Option<&dyn Message>) -> anyhow::Result<()> {
        if let Some(message) = message {
            if !self.send_message(message, false).await? {
                warn!("disconnect notice could not be framed - closing without notice");
            }
        }

        self.cancel_token.cancel();

        if let Some(connection) = self.handle.connection.write().await.take() {
            connection.close().await;
        }

        for (task, handle) in [("receive", self.receive_task.take()), ("dispatch", self.dispatch_task.take())] {
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    let _ = self.fault_tx.send(TaskFault {
                        task,
                        error: anyhow!("task panicked: {}", e),
                    }).await;
                }
            }
        }

        info!("disconnected");
        Ok(())
    }

    fn spawn_supervised(
        task: &'static str,
        fault_tx: mpsc::Sender<TaskFault>,
        fut: impl Future<Output = anyhow::Result<()>> + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(error) = fut.await {
                error!("{} loop terminated: {:#}", task, error);
                let _ = fault_tx.send(TaskFault { task, error }).await;
            }
        })
    }

    /// Pulls datagrams off the transport, feeds them to the channel and appends everything
    ///  that became complete to the queue. Runs until cancelled; a transport failure is
    ///  terminal and surfaces as the task's result.
    async fn receive_loop(
        handle: ClientHandle,
        connection: Arc<dyn Connection>,
        queue: mpsc::Sender<NetMessage>,
        cancel_token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("starting receive loop");

        loop {
            let packet_buf = select! {
                _ = cancel_token.cancelled() => break,
                received = connection.receive() => match received {
                    Ok(packet_buf) => packet_buf,
                    Err(e) => {
                        if cancel_token.is_cancelled() {
                            // a read failing on a transport that was just closed is part of
                            //  orderly shutdown, not a fault
                            break;
                        }
                        return Err(e.context("transport failure"));
                    }
                },
            };

            trace!("received packet of length {}", packet_buf.len());

            let (messages, waiting_on_fragments) = {
                let mut channel = handle.channel.lock().await;
                if let Err(e) = channel.process_packet(&packet_buf) {
                    debug!("dropping malformed packet: {:#}", e);
                }
                (channel.take_messages(), channel.waiting_on_fragments())
            };

            if waiting_on_fragments {
                // solicit retransmission: an empty packet piggybacking the subchannel ack bits
                //  tells the peer which slots are still incomplete
                if let Err(e) = handle.send_message(&NetMessage::reliable(Vec::new()), true).await {
                    debug!("could not send fragment solicitation: {:#}", e);
                }
            }

            for message in messages {
                if queue.send(message).await.is_err() {
                    debug!("message queue is closed - stopping receive loop");
                    return Ok(());
                }
            }
        }

        debug!("receive loop cancelled");
        Ok(())
    }

    /// Drains the queue and delivers each message to every registered listener, in
    ///  registration order. A message whose type tag cannot be decoded is skipped; the loop
    ///  itself only stops on cancellation.
    async fn dispatch_loop(
        listeners: Arc<RwLock<Vec<Box<dyn Listener>>>>,
        mut queue: mpsc::Receiver<NetMessage>,
        cancel_token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("starting dispatch loop");

        loop {
            let message = select! {
                _ = cancel_token.cancelled() => break,
                received = queue.recv() => match received {
                    Some(message) => message,
                    None => {
                        debug!("message queue is closed - stopping dispatch loop");
                        return Ok(());
                    }
                },
            };

            let message_type = match message.message_type() {
                Ok(message_type) => message_type,
                Err(e) => {
                    warn!("skipping message without a decodable type tag: {:#}", e);
                    continue;
                }
            };

            let listeners = listeners.read().await;
            trace!("dispatching message of type {} to {} listeners", message_type, listeners.len());
            for listener in listeners.iter() {
                listener.receive(&message, message_type);
            }
        }

        debug!("dispatch loop cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_buf::BitWriter;
    use crate::connection::MockConnection;
    use crate::listener::MockListener;
    use crate::message::{DisconnectMessage, NETMSG_TYPE_BITS};
    use crate::packet_header::{FragmentDescriptor, PacketFlags, PacketHeader};
    use bytes::{BufMut, BytesMut};
    use mockall::Sequence;
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::{sleep, timeout};

    fn test_config() -> NetChannelConfig {
        NetChannelConfig {
            fragment_size: 4,
            queue_capacity: 16,
            ..NetChannelConfig::default_ipv4()
        }
    }

    fn sequenced_packet(sequence: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        PacketHeader::new(sequence, 0).ser(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    /// transport double that replays a scripted list of inbound datagrams and records
    ///  everything sent through it
    #[derive(Default)]
    struct ScriptedConnection {
        incoming: std::sync::Mutex<VecDeque<Vec<u8>>>,
        sent: std::sync::Mutex<Vec<Vec<u8>>>,
    }
    impl ScriptedConnection {
        fn with_incoming(packets: Vec<Vec<u8>>) -> Arc<ScriptedConnection> {
            Arc::new(ScriptedConnection {
                incoming: std::sync::Mutex::new(packets.into()),
                sent: Default::default(),
            })
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }
    #[async_trait::async_trait]
    impl Connection for ScriptedConnection {
        async fn send(&self, packet_buf: &[u8]) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(packet_buf.to_vec());
            Ok(())
        }

        async fn receive(&self) -> anyhow::Result<Vec<u8>> {
            loop {
                if let Some(packet) = self.incoming.lock().unwrap().pop_front() {
                    return Ok(packet);
                }
                sleep(Duration::from_millis(1)).await;
            }
        }

        async fn close(&self) {}
    }

    #[derive(Clone, Default)]
    struct RecordingListener {
        received: Arc<std::sync::Mutex<Vec<(u32, Vec<u8>)>>>,
    }
    impl RecordingListener {
        fn received(&self) -> Vec<(u32, Vec<u8>)> {
            self.received.lock().unwrap().clone()
        }
    }
    impl Listener for RecordingListener {
        fn register(&mut self, _client: &ClientHandle) {}

        fn receive(&self, message: &dyn Message, message_type: u32) {
            self.received.lock().unwrap().push((message_type, message.data().to_vec()));
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(1)).await;
            }
        }).await.expect("condition was not reached within the timeout");
    }

    /// every queued message reaches every listener exactly once, in order, regardless of how
    ///  producer and consumer interleave
    #[rstest]
    fn test_exactly_once_dispatch() {
        let rt = Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap();
        rt.block_on(async {
            const NUM_MESSAGES: usize = 50;

            let packets = (0..NUM_MESSAGES)
                .map(|i| sequenced_packet(i as u32 + 1, format!("message-{}", i).as_bytes()))
                .collect();
            let connection = ScriptedConnection::with_incoming(packets);

            let mut client = NetClient::new(test_config()).unwrap();
            let listener_a = RecordingListener::default();
            let listener_b = RecordingListener::default();
            client.add_listener(Box::new(listener_a.clone())).await;
            client.add_listener(Box::new(listener_b.clone())).await;
            client.connect_with(connection).await.unwrap();

            wait_until(|| listener_a.received().len() >= NUM_MESSAGES && listener_b.received().len() >= NUM_MESSAGES).await;
            client.disconnect(None).await.unwrap();

            let expected = (0..NUM_MESSAGES)
                .map(|i| (crate::message::MESSAGE_TYPE_QUERY, format!("message-{}", i).into_bytes()))
                .collect::<Vec<_>>();
            assert_eq!(listener_a.received(), expected);
            assert_eq!(listener_b.received(), expected);
        });
    }

    #[rstest]
    fn test_connectionless_message_dispatches_with_type_tag() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut writer = BitWriter::new();
            writer.write_bits(3, NETMSG_TYPE_BITS);
            writer.write_bytes(b"ping");
            let payload = writer.into_bytes();

            let mut packet = vec![0xff, 0xff, 0xff, 0xff];
            packet.extend_from_slice(&payload);

            let connection = ScriptedConnection::with_incoming(vec![packet]);
            let mut client = NetClient::new(test_config()).unwrap();
            let listener = RecordingListener::default();
            client.add_listener(Box::new(listener.clone())).await;
            client.connect_with(connection).await.unwrap();

            wait_until(|| !listener.received().is_empty()).await;
            client.disconnect(None).await.unwrap();

            assert_eq!(listener.received(), vec![(3, payload)]);
        });
    }

    /// the disconnect notice goes out on the wire before the transport is closed
    #[rstest]
    fn test_disconnect_sends_notice_before_close() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut connection = MockConnection::new();
            let mut sequence = Sequence::new();

            connection.expect_receive()
                .returning(|| Err(anyhow!("connection closed")));
            connection.expect_send()
                .once()
                .in_sequence(&mut sequence)
                .withf(|packet_buf| packet_buf == [0,0,0,1, 0,0,0,0, 0x01, 0x05, 0x89, 0xe5, 0x94, 0x00])
                .returning(|_| Ok(()));
            connection.expect_close()
                .once()
                .in_sequence(&mut sequence)
                .returning(|| ());

            let mut client = NetClient::new(test_config()).unwrap();
            client.connect_with(Arc::new(connection)).await.unwrap();

            client.disconnect(Some(&DisconnectMessage::new("bye"))).await.unwrap();
        });
    }

    #[rstest]
    fn test_transport_failure_surfaces_as_fault() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut connection = MockConnection::new();
            connection.expect_receive()
                .returning(|| Err(anyhow!("network down")));
            connection.expect_close()
                .returning(|| ());

            let mut client = NetClient::new(test_config()).unwrap();
            let mut faults = client.take_faults().unwrap();
            client.connect_with(Arc::new(connection)).await.unwrap();

            let fault = timeout(Duration::from_secs(5), faults.recv()).await.unwrap().unwrap();
            assert_eq!(fault.task, "receive");
            assert!(fault.error.to_string().contains("transport failure"));

            client.disconnect(None).await.unwrap();
        });
    }

    #[rstest]
    fn test_send_message_framing_failure_sends_nothing() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let connection = ScriptedConnection::with_incoming(Vec::new());
            let mut client = NetClient::new(test_config()).unwrap();
            client.connect_with(connection.clone()).await.unwrap();

            let oversized = NetMessage::reliable(vec![0; 5000]);
            assert!(!client.send_message(&oversized, false).await.unwrap());
            assert!(connection.sent().is_empty());

            assert!(client.send_message(&NetMessage::reliable(b"fits".to_vec()), false).await.unwrap());
            let sent = connection.sent();
            assert_eq!(sent.len(), 1);
            // the first successfully framed packet carries sequence 1 - the failed attempt
            //  did not advance the counter
            let mut buf: &[u8] = &sent[0];
            assert_eq!(PacketHeader::deser(&mut buf).unwrap().sequence, 1);

            client.disconnect(None).await.unwrap();
        });
    }

    #[rstest]
    fn test_connectionless_message_is_sent_verbatim() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let connection = ScriptedConnection::with_incoming(Vec::new());
            let mut client = NetClient::new(test_config()).unwrap();
            client.connect_with(connection.clone()).await.unwrap();

            let payload = vec![0xff, 0xff, 0xff, 0xff, 0x0c];
            assert!(client.send_message(&NetMessage::connectionless(payload.clone()), false).await.unwrap());
            assert_eq!(connection.sent(), vec![payload]);

            client.disconnect(None).await.unwrap();
        });
    }

    /// an incomplete subchannel triggers a solicitation packet piggybacking the ack bits
    #[rstest]
    fn test_incomplete_fragments_trigger_solicitation() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let descriptor = FragmentDescriptor {
                subchannel: 0,
                message_id: 1,
                total_length: 6,
                fragment_index: 0,
                fragment_count: 2,
            };
            let mut buf = BytesMut::new();
            PacketHeader::new(1, 0).with_fragment(descriptor).ser(&mut buf);
            buf.put_slice(&[1, 2, 3, 4]);

            let connection = ScriptedConnection::with_incoming(vec![buf.to_vec()]);
            let mut client = NetClient::new(test_config()).unwrap();
            client.connect_with(connection.clone()).await.unwrap();

            wait_until(|| !connection.sent().is_empty()).await;
            client.disconnect(None).await.unwrap();

            let sent = connection.sent();
            let mut b: &[u8] = &sent[0];
            let header = PacketHeader::deser(&mut b).unwrap();
            assert!(header.flags.contains(PacketFlags::SUBCHANNEL_ACK));
            assert_eq!(header.subchannel_ack_bits, Some(0b01));
            assert!(b.is_empty());
        });
    }

    #[rstest]
    fn test_send_before_connect_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let client = NetClient::new(test_config()).unwrap();
            assert!(client.send_message(&NetMessage::reliable(b"x".to_vec()), false).await.is_err());
        });
    }

    #[rstest]
    fn test_double_connect_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut client = NetClient::new(test_config()).unwrap();
            client.connect_with(ScriptedConnection::with_incoming(Vec::new())).await.unwrap();
            assert!(client.connect_with(ScriptedConnection::with_incoming(Vec::new())).await.is_err());
            client.disconnect(None).await.unwrap();
        });
    }

    #[rstest]
    fn test_register_hook_runs_on_add() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut listener = MockListener::new();
            listener.expect_register()
                .once()
                .returning(|_| ());

            let client = NetClient::new(test_config()).unwrap();
            client.add_listener(Box::new(listener)).await;
        });
    }
}
