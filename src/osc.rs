//! OSC-over-UDP transmitter for body and face signals.
//!
//! Every value travels as its own message with a single float argument, e.g.
//! `/body/left_wrist/x 0.42` or `/face/smile 0.2`.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use rosc::{OscMessage, OscPacket, OscType, encoder};
use thiserror::Error;

use crate::types::{ExpressionSignal, FaceExpression, JointSample};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 11574;

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("failed to resolve OSC destination {0}")]
    Resolve(String),

    #[error("failed to bind OSC socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to encode OSC message {address}: {reason}")]
    Encode { address: String, reason: String },

    #[error("failed to send OSC message {address}: {source}")]
    Send {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fire-and-forget destination for named scalar signals.
pub trait SignalSink: Send + Sync + 'static {
    fn send(&self, address: &str, value: f32) -> Result<(), TransmitError>;
}

pub struct OscTransmitter {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscTransmitter {
    pub fn new(host: &str, port: u16) -> Result<Self, TransmitError> {
        let target = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransmitError::Resolve(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| TransmitError::Resolve(format!("{host}:{port}")))?;

        let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).map_err(TransmitError::Bind)?;

        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl SignalSink for OscTransmitter {
    fn send(&self, address: &str, value: f32) -> Result<(), TransmitError> {
        let packet = encode_message(address, value)?;
        self.socket
            .send_to(&packet, self.target)
            .map_err(|source| TransmitError::Send {
                address: address.to_string(),
                source,
            })?;
        Ok(())
    }
}

pub fn encode_message(address: &str, value: f32) -> Result<Vec<u8>, TransmitError> {
    let msg = OscMessage {
        addr: address.to_string(),
        args: vec![OscType::Float(value)],
    };
    encoder::encode(&OscPacket::Message(msg)).map_err(|err| TransmitError::Encode {
        address: address.to_string(),
        reason: format!("{err:?}"),
    })
}

pub fn body_messages(joints: &[JointSample]) -> Vec<(String, f32)> {
    joints
        .iter()
        .flat_map(|joint| {
            joint
                .channels()
                .map(|(channel, value)| (format!("/body/{}/{channel}", joint.part.name()), value))
        })
        .collect()
}

pub fn face_messages(expression: &FaceExpression) -> Vec<(String, f32)> {
    ExpressionSignal::ALL
        .iter()
        .map(|&signal| (signal.address().to_string(), expression.value(signal)))
        .collect()
}

/// Outcome of pushing one batch of messages through a sink.
#[derive(Debug, Default)]
pub struct Delivery {
    pub sent: usize,
    pub failed: usize,
    pub first_error: Option<TransmitError>,
}

/// Sends every message, carrying on past individual failures. `proceed` is
/// asked before each message; the batch ends as soon as it returns false.
pub fn send_batch(
    sink: &dyn SignalSink,
    messages: &[(String, f32)],
    mut proceed: impl FnMut() -> bool,
) -> Delivery {
    let mut delivery = Delivery::default();
    for (address, value) in messages {
        if !proceed() {
            break;
        }
        match sink.send(address, *value) {
            Ok(()) => delivery.sent += 1,
            Err(err) => {
                delivery.failed += 1;
                delivery.first_error.get_or_insert(err);
            }
        }
    }
    delivery
}
