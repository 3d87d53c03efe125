//! Scripted AMQP peer for driving a client over `tokio::io::duplex`.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use amqpwire::codec::{EncodeOptions, Symbol};
use amqpwire::protocol::{
    build_amqp_frame, build_sasl_frame, AmqpFrame, Attach, Begin, Close, DeliveryState,
    Disposition, Flow, Frame, FrameBuffer, Incoming, Message, Open, Outcome, Performative,
    ProtocolHeader, Role, SaslCode, SaslFrame, SaslInit, SaslMechanisms, SaslOutcome, Transfer,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct ScriptedPeer {
    stream: DuplexStream,
    buffer: FrameBuffer,
    encode: EncodeOptions,
}

impl ScriptedPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            encode: EncodeOptions::default(),
        }
    }

    /// Answer the AMQP header and the client's `open` with a default `open`.
    pub async fn accept(stream: DuplexStream) -> Self {
        Self::accept_with(stream, peer_open()).await
    }

    pub async fn accept_with(stream: DuplexStream, open: Open) -> Self {
        let mut peer = Self::new(stream);
        peer.exchange_header(ProtocolHeader::amqp()).await;
        peer.expect_open().await;
        peer.send(0, open).await;
        peer
    }

    /// Run the SASL server side, offering PLAIN. Returns the client's
    /// `sasl-init` and, on success, the peer positioned after the AMQP
    /// header exchange.
    pub async fn sasl_plain(mut self, accept: bool) -> (SaslInit, Option<Self>) {
        self.exchange_header(ProtocolHeader::sasl()).await;
        let offer = SaslFrame::Mechanisms(SaslMechanisms {
            mechanisms: vec![Symbol::from("ANONYMOUS"), Symbol::from("PLAIN")],
        });
        self.send_raw(&build_sasl_frame(&offer).unwrap()).await;

        let init = match self.next_raw().await.decode_sasl().unwrap() {
            SaslFrame::Init(init) => init,
            other => panic!("expected sasl-init, got {:?}", other),
        };
        let code = if accept { SaslCode::Ok } else { SaslCode::Auth };
        let outcome = SaslFrame::Outcome(SaslOutcome {
            code,
            additional_data: None,
        });
        self.send_raw(&build_sasl_frame(&outcome).unwrap()).await;

        if !accept {
            return (init, None);
        }
        self.exchange_header(ProtocolHeader::amqp()).await;
        (init, Some(self))
    }

    /// Read the client's protocol header and echo it.
    pub async fn exchange_header(&mut self, expected: ProtocolHeader) {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(ProtocolHeader::decode(&header).unwrap(), expected);
        self.send_raw(&expected.encode()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send(&mut self, channel: u16, performative: impl Into<Performative>) {
        self.send_with_payload(channel, performative, &[]).await;
    }

    pub async fn send_with_payload(
        &mut self,
        channel: u16,
        performative: impl Into<Performative>,
        payload: &[u8],
    ) {
        let frame =
            build_amqp_frame(channel, &performative.into(), payload, &self.encode).unwrap();
        self.send_raw(&frame).await;
    }

    /// Next complete frame; `None` once the client closed the stream.
    pub async fn try_next_raw(&mut self) -> Option<Frame> {
        loop {
            if let Some(item) = self.buffer.next_item().unwrap() {
                match item {
                    Incoming::Frame(frame) => return Some(frame),
                    Incoming::Header(header) => panic!("unexpected header {:?}", header),
                }
            }
            let mut chunk = vec![0u8; 16 * 1024];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buffer.extend(&chunk[..n]);
        }
    }

    pub async fn next_raw(&mut self) -> Frame {
        self.try_next_raw().await.expect("client closed the stream")
    }

    /// Next non-heartbeat frame.
    pub async fn next_frame(&mut self) -> AmqpFrame {
        loop {
            let frame = self.next_raw().await.decode_amqp().unwrap();
            if !frame.is_heartbeat() {
                return frame;
            }
        }
    }

    pub async fn next_performative(&mut self) -> (u16, Performative) {
        let frame = self.next_frame().await;
        (frame.channel, frame.performative.unwrap())
    }

    /// Next frame, or `None` if nothing arrives within `wait`.
    pub async fn next_frame_within(&mut self, wait: Duration) -> Option<AmqpFrame> {
        tokio::time::timeout(wait, self.next_frame()).await.ok()
    }

    pub async fn expect_open(&mut self) -> Open {
        match self.next_performative().await {
            (0, Performative::Open(open)) => open,
            other => panic!("expected open, got {:?}", other),
        }
    }

    /// Skip frames until the client's `close`.
    pub async fn expect_close(&mut self) -> Close {
        loop {
            if let (_, Performative::Close(close)) = self.next_performative().await {
                return close;
            }
        }
    }

    /// Answer the client's `begin`. Returns the channel.
    pub async fn begin(&mut self) -> u16 {
        let channel = match self.next_performative().await {
            (channel, Performative::Begin(begin)) => {
                assert_eq!(begin.remote_channel, None);
                channel
            }
            other => panic!("expected begin, got {:?}", other),
        };
        self.send(
            channel,
            Begin {
                remote_channel: Some(channel),
                next_outgoing_id: 0,
                incoming_window: 2048,
                outgoing_window: 2048,
                handle_max: 1023,
                offered_capabilities: vec![],
                desired_capabilities: vec![],
                properties: None,
            },
        )
        .await;
        channel
    }

    /// Answer the client's `attach` with the mirrored attach. Returns the
    /// client's attach.
    pub async fn attach(&mut self) -> Attach {
        let (channel, attach) = match self.next_performative().await {
            (channel, Performative::Attach(attach)) => (channel, attach),
            other => panic!("expected attach, got {:?}", other),
        };
        let role = attach.role.opposite();
        let reply = Attach {
            role,
            initial_delivery_count: (role == Role::Sender).then_some(0),
            ..attach.clone()
        };
        self.send(channel, reply).await;
        attach
    }

    /// Grant link credit to a client sender.
    pub async fn grant(&mut self, channel: u16, handle: u32, delivery_count: u32, credit: u32) {
        self.send(
            channel,
            Flow {
                next_incoming_id: Some(delivery_count),
                incoming_window: 2048,
                next_outgoing_id: 0,
                outgoing_window: 2048,
                handle: Some(handle),
                delivery_count: Some(delivery_count),
                link_credit: Some(credit),
                ..Default::default()
            },
        )
        .await;
    }

    /// Next `transfer` frame with its payload, skipping flows.
    pub async fn next_transfer(&mut self) -> (Transfer, Bytes) {
        loop {
            let frame = self.next_frame().await;
            match frame.performative {
                Some(Performative::Transfer(transfer)) => return (transfer, frame.payload),
                Some(Performative::Flow(_)) => continue,
                other => panic!("expected transfer, got {:?}", other),
            }
        }
    }

    /// Next `disposition`, skipping flows.
    pub async fn next_disposition(&mut self) -> Disposition {
        loop {
            match self.next_performative().await {
                (_, Performative::Disposition(disposition)) => return disposition,
                (_, Performative::Flow(_)) => continue,
                other => panic!("expected disposition, got {:?}", other),
            }
        }
    }

    /// Settle client deliveries `[first, last]` with `outcome`.
    pub async fn settle(&mut self, channel: u16, first: u32, last: u32, outcome: Outcome) {
        self.send(
            channel,
            Disposition {
                role: Role::Receiver,
                first,
                last: Some(last),
                settled: true,
                state: Some(DeliveryState::Outcome(outcome)),
                batchable: false,
            },
        )
        .await;
    }

    /// Deliver a message to a client receiver in one frame.
    pub async fn transfer(&mut self, channel: u16, handle: u32, delivery_id: u32, message: &Message) {
        let payload = message.to_bytes().unwrap();
        self.send_with_payload(
            channel,
            Transfer {
                handle,
                delivery_id: Some(delivery_id),
                delivery_tag: Some(Bytes::copy_from_slice(&delivery_id.to_be_bytes())),
                message_format: Some(0),
                settled: Some(false),
                ..Default::default()
            },
            &payload,
        )
        .await;
    }

    pub async fn close(&mut self) {
        self.send(0, Close { error: None }).await;
    }
}

pub fn peer_open() -> Open {
    let mut open = Open::new("scripted-peer");
    open.max_frame_size = 65536;
    open.channel_max = 255;
    open
}
