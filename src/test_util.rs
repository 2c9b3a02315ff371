use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ack::responder::MessageReceiver;
use crate::protocol::envelope::{Envelope, Message};
use crate::transport::{DatagramHandler, Transport};

/// convenience method for unit test code: create a [SocketAddr] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}


/// A [Transport] that does not send anything but records all datagrams passed to it
pub struct RecordingTransport {
    self_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn new(self_addr: SocketAddr) -> RecordingTransport {
        RecordingTransport {
            self_addr,
            sent: Default::default(),
        }
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// all recorded datagrams, decoded - panics if one of them is not a valid envelope
    pub fn sent_envelopes(&self) -> Vec<(SocketAddr, Envelope)> {
        self.sent().into_iter()
            .map(|(to, buf)| (to, Envelope::try_deser(&buf).unwrap()))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn local_addr(&self) -> SocketAddr {
        self.self_addr
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((to, buf.to_vec()));
        Ok(())
    }

    async fn recv_loop(&self, _handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) {}
}


/// A [MessageReceiver] collecting all received messages
#[derive(Default)]
pub struct CollectingReceiver {
    received: Mutex<Vec<(Message, SocketAddr)>>,
    notify: Notify,
}

impl CollectingReceiver {
    pub fn received(&self) -> Vec<(Message, SocketAddr)> {
        self.received.lock().unwrap().clone()
    }

    /// waits until at least `n` messages were received
    pub async fn wait_for(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            if self.received.lock().unwrap().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageReceiver for CollectingReceiver {
    async fn on_message(&self, message: Message, from: SocketAddr) {
        self.received.lock().unwrap().push((message, from));
        self.notify.notify_waiters();
    }
}
