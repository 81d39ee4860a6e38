//! The serial link to the host.

use core::{future::Future, task::Poll};

use curve_tracer_core::{
    config::Instant,
    frame::{self, Payload},
    receive::ByteSource,
};
use embassy_sync::waitqueue::WakerRegistration;
use embedded_hal::serial::Write;
use futures::future::poll_fn;
use heapless::spsc::{Consumer, Producer, Queue};
use rtic::Mutex;
use rtic_monotonics::{systick::Systick, Monotonic};

pub const BAUD_RATE: u32 = 115_200;
pub const RX_QUEUE_LEN: usize = 64;

pub type RxQueue = Queue<u8, RX_QUEUE_LEN>;
pub type RxProducer = Producer<'static, u8, RX_QUEUE_LEN>;
pub type RxConsumer = Consumer<'static, u8, RX_QUEUE_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum LinkError {
    /// The UART reported an error while sending.
    Write,
}

/// Transmit half of the link. Only accessed through the arbiter, so frames never interleave.
pub struct Link<TX> {
    tx: TX,
}

impl<TX: Write<u8>> Link<TX> {
    pub fn new(tx: TX) -> Self {
        Self { tx }
    }

    /// Sends one reply frame, blocking until the last byte is handed to the UART.
    pub fn send(&mut self, payload: &Payload<'_>) -> Result<(), LinkError> {
        let tx = &mut self.tx;
        frame::encode(payload, |bytes| write_all(tx, bytes))?;
        nb::block!(tx.flush()).map_err(|_| LinkError::Write)
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), LinkError> {
        self.send(&Payload::Status(text))
    }
}

fn write_all<TX: Write<u8>>(tx: &mut TX, bytes: &[u8]) -> Result<(), LinkError> {
    for &byte in bytes {
        nb::block!(tx.write(byte)).map_err(|_| LinkError::Write)?;
    }
    Ok(())
}

/// Waits for the next byte queued by the UART interrupt.
pub async fn next_byte(
    bytes: &mut RxConsumer,
    rx_waker: &mut impl Mutex<T = WakerRegistration>,
) -> u8 {
    poll_fn(|cx| {
        // Register before looking so a byte arriving in between still wakes us
        rx_waker.lock(|waker| waker.register(cx.waker()));

        match bytes.dequeue() {
            Some(byte) => Poll::Ready(byte),
            None => Poll::Pending,
        }
    })
    .await
}

/// The receive queue timed by the system tick.
pub struct UartBytes<'a, M> {
    bytes: &'a mut RxConsumer,
    rx_waker: &'a mut M,
}

impl<'a, M: Mutex<T = WakerRegistration>> UartBytes<'a, M> {
    pub fn new(bytes: &'a mut RxConsumer, rx_waker: &'a mut M) -> Self {
        Self { bytes, rx_waker }
    }
}

impl<M: Mutex<T = WakerRegistration>> ByteSource for UartBytes<'_, M> {
    fn now(&self) -> Instant {
        Systick::now()
    }

    fn next_byte(&mut self) -> impl Future<Output = u8> {
        next_byte(self.bytes, self.rx_waker)
    }

    fn next_byte_before(&mut self, deadline: Instant) -> impl Future<Output = Option<u8>> {
        async move {
            Systick::timeout_at(deadline, next_byte(self.bytes, self.rx_waker))
                .await
                .ok()
        }
    }
}

/// Moves received bytes into the queue. Returns how many did not fit.
pub fn enqueue_received(
    producer: &mut RxProducer,
    mut read: impl FnMut() -> nb::Result<u8, ()>,
) -> usize {
    let mut dropped = 0;
    loop {
        match read() {
            Ok(byte) => {
                if producer.enqueue(byte).is_err() {
                    dropped += 1;
                }
            }
            Err(nb::Error::WouldBlock) | Err(nb::Error::Other(())) => break,
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve_tracer_core::CurveKind;
    use std::vec::Vec;

    #[derive(Default)]
    struct Uart {
        sent: Vec<u8>,
        busy: bool,
    }

    impl Write<u8> for Uart {
        type Error = ();

        fn write(&mut self, word: u8) -> nb::Result<(), ()> {
            // Every other call pretends the data register is still full
            self.busy = !self.busy;
            if self.busy {
                return Err(nb::Error::WouldBlock);
            }
            self.sent.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn heartbeat_frame() {
        let mut link = Link::new(Uart::default());
        link.send_text("c,0").unwrap();
        assert_eq!(link.tx.sent, b"RP:3;c,0end");
    }

    #[test]
    fn capture_frame() {
        let mut link = Link::new(Uart::default());
        link.send(&Payload::Capture {
            kind: CurveKind::Vbe,
            samples: &[0x123, 0x456],
        })
        .unwrap();
        assert_eq!(link.tx.sent, b"RP:5;f,\x23\x14\x56end");
    }

    #[test]
    fn received_bytes_overflow_the_queue() {
        let queue: &'static mut RxQueue = Box::leak(Box::new(RxQueue::new()));
        let (mut producer, mut consumer) = queue.split();

        let mut pending = 0..(RX_QUEUE_LEN as u8 + 10);
        let dropped = enqueue_received(&mut producer, || {
            pending.next().ok_or(nb::Error::WouldBlock)
        });

        // One slot of a heapless queue always stays free
        assert_eq!(dropped, 11);
        assert_eq!(consumer.dequeue(), Some(0));
        assert_eq!(consumer.len(), RX_QUEUE_LEN - 2);
    }
}
