use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rand::Rng;
use tracing::trace;

use crate::transport::{DatagramHandler, Transport};

/// Wraps a [Transport], randomly dropping and duplicating outgoing datagrams. This simulates an
///  unreliable network for testing the acknowledgement protocol.
pub struct LossyTransport {
    inner: Arc<dyn Transport>,
    drop_probability: f64,
    duplicate_probability: f64,
}

impl LossyTransport {
    pub fn new(inner: Arc<dyn Transport>, drop_probability: f64, duplicate_probability: f64) -> anyhow::Result<LossyTransport> {
        if !(0.0..=1.0).contains(&drop_probability) {
            bail!("drop probability must be between 0.0 and 1.0, was {}", drop_probability);
        }
        if !(0.0..=1.0).contains(&duplicate_probability) {
            bail!("duplicate probability must be between 0.0 and 1.0, was {}", duplicate_probability);
        }

        Ok(LossyTransport {
            inner,
            drop_probability,
            duplicate_probability,
        })
    }
}

#[async_trait]
impl Transport for LossyTransport {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let (is_dropped, is_duplicated) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(self.drop_probability), rng.gen_bool(self.duplicate_probability))
        };

        if is_dropped {
            trace!("simulated loss: dropping datagram to {:?}", to);
            return Ok(());
        }

        self.inner.send(to, buf).await?;
        if is_duplicated {
            trace!("simulated duplication: sending datagram to {:?} twice", to);
            self.inner.send(to, buf).await?;
        }
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        self.inner.recv_loop(handler).await
    }

    fn close(&self) {
        self.inner.close()
    }
}
