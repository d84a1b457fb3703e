//! Activation detector for a running user program.
//!
//! Watches the communication channels for a CONNECT command without running the protocol
//! itself. Once one arrives the user program hands over to the bootloader.
use std::time::{Duration, Instant};

use crate::constants::{MAX_PACKET_SIZE, commands};
use crate::transport::byte_checksum;

/// Time allowed for a UART packet to complete, counted from its length byte.
pub const UART_PACKET_TIMEOUT: Duration = Duration::from_millis(100);

/// Length of the counter in front of every XCP on TCP/IP packet.
const NET_COUNTER_LEN: usize = 4;

/// True for exactly the two byte CONNECT command.
pub fn is_connect_command(packet: &[u8]) -> bool {
    packet.len() == 2 && packet[0] == commands::CONNECT
}

/// A CAN frame carries one packet without any framing around it.
pub fn can_frame_requests_activation(data: &[u8]) -> bool {
    is_connect_command(data)
}

/// A TCP payload starts with the 32-bit CRO counter.
pub fn net_payload_requests_activation(payload: &[u8]) -> bool {
    payload.len() > NET_COUNTER_LEN && is_connect_command(&payload[NET_COUNTER_LEN..])
}

/// Non-blocking source of received bytes.
pub trait ByteReceiver {
    fn receive_byte(&mut self) -> Option<u8>;
}

/// Reassembles `[len][data...][checksum?]` packets from single UART bytes.
#[derive(Debug)]
pub struct UartDetector {
    max_data: u8,
    checksum: bool,
    timeout: Duration,
    /// Length byte, data and checksum.
    packet: [u8; MAX_PACKET_SIZE + 2],
    /// Set while a packet is being received.
    started: Option<Instant>,
    received: usize,
}

impl UartDetector {
    /// `max_data` is the largest packet accepted, packets announcing more are ignored.
    pub fn new(max_data: u8, checksum: bool) -> Self {
        UartDetector {
            max_data,
            checksum,
            timeout: UART_PACKET_TIMEOUT,
            packet: [0; MAX_PACKET_SIZE + 2],
            started: None,
            received: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_receiving(&self) -> bool {
        self.started.is_some()
    }

    /// Feed the outcome of one poll: the received byte, if any, at `now`.
    ///
    /// Returns true once a complete packet holding a CONNECT command was received.
    pub fn process(&mut self, byte: Option<u8>, now: Instant) -> bool {
        let Some(started) = self.started else {
            if let Some(len) = byte {
                if len > 0 && len <= self.max_data {
                    self.packet[0] = len;
                    self.received = 0;
                    self.started = Some(now);
                }
            }
            return false;
        };

        let Some(byte) = byte else {
            if now.duration_since(started) > self.timeout {
                log::trace!("discarding incomplete packet after {:?}", self.timeout);
                self.started = None;
            }
            return false;
        };

        self.received += 1;
        self.packet[self.received] = byte;
        let len = usize::from(self.packet[0]);
        if self.received < len + usize::from(self.checksum) {
            return false;
        }
        self.started = None;

        let data = &self.packet[1..=len];
        if self.checksum && self.packet[len + 1] != byte_checksum(self.packet[0], data) {
            log::trace!("dropping packet with a bad checksum");
            return false;
        }
        is_connect_command(data)
    }
}

/// Polls the enabled channels and calls `on_activate` when a CONNECT command shows up.
pub struct ActivationDetector<R, F> {
    uart: Option<(R, UartDetector)>,
    on_activate: F,
}

impl<R: ByteReceiver, F: FnMut()> ActivationDetector<R, F> {
    pub fn new(on_activate: F) -> Self {
        ActivationDetector {
            uart: None,
            on_activate,
        }
    }

    pub fn with_uart(mut self, receiver: R, detector: UartDetector) -> Self {
        self.uart = Some((receiver, detector));
        self
    }

    /// Poll the UART once. Returns true if activation was requested.
    pub fn check(&mut self, now: Instant) -> bool {
        let requested = match &mut self.uart {
            Some((receiver, detector)) => {
                let byte = receiver.receive_byte();
                detector.process(byte, now)
            }
            None => false,
        };
        self.activate_if(requested)
    }

    /// Inspect a received CAN frame.
    pub fn on_can_frame(&mut self, data: &[u8]) -> bool {
        self.activate_if(can_frame_requests_activation(data))
    }

    /// Inspect a received TCP payload.
    pub fn on_net_payload(&mut self, payload: &[u8]) -> bool {
        self.activate_if(net_payload_requests_activation(payload))
    }

    fn activate_if(&mut self, requested: bool) -> bool {
        if requested {
            log::info!("Bootloader activation requested");
            (self.on_activate)();
        }
        requested
    }
}
