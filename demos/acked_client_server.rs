use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use acked_udp::ack::responder::MessageReceiver;
use acked_udp::config::AckConfig;
use acked_udp::end_point::EndPoint;
use acked_udp::protocol::envelope::Message;
use acked_udp::protocol::message_type::MessageType::*;
use acked_udp::transport::lossy::LossyTransport;
use acked_udp::transport::UdpTransport;
use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:9810")]
    server_address: String,

    #[clap(long, default_value = "127.0.0.1:0")]
    client_address: String,

    /// probability of the server losing an acknowledgement, for watching retries at work
    #[clap(long, default_value_t = 0.0)]
    ack_loss: f64,

    #[clap(long, default_value_t = 5)]
    max_retries: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingReceiver;

#[async_trait]
impl MessageReceiver for LoggingReceiver {
    async fn on_message(&self, message: Message, from: SocketAddr) {
        info!("server received {:?} from {:?}: {}", message.message_type, from, String::from_utf8_lossy(&message.content));
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let server_config = AckConfig::new(args.server_address.parse()?);
    server_config.validate()?;
    let server_config = Arc::new(server_config);
    let server_transport = Arc::new(UdpTransport::bind(server_config.self_addr, server_config.max_datagram_size).await?);
    let server_transport = Arc::new(LossyTransport::new(server_transport, args.ack_loss, 0.0)?);
    let server = Arc::new(EndPoint::with_transport(server_config, server_transport, Arc::new(LoggingReceiver)));

    let mut client_config = AckConfig::new(args.client_address.parse()?);
    client_config.max_retries = args.max_retries;
    let client = Arc::new(EndPoint::new(client_config, Arc::new(LoggingReceiver)).await?);

    let server_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.recv_loop().await })
    };
    let client_loop = {
        let client = client.clone();
        tokio::spawn(async move { client.recv_loop().await })
    };

    let messages = vec![
        Message::new(Register, "registering_with_acks"),
        Message::new(Register, "this_is_a_state_id"),
        Message::new(Register, "not_the_final_message"),
        Message::new(RegisterWithAcknowledges, "Registering with acks"),
        Message::new(StateId, "This is a state_id"),
        Message::new(Command, "final_message"),
    ];

    for message in messages {
        let message_type = message.message_type;
        let outcome = client.send_acknowledged(message, server.self_addr(), true).await?;
        info!("sent {:?}: {:?}", message_type, outcome);
    }

    tokio::time::timeout(Duration::from_secs(10), client.wait_until_drained()).await
        .map_err(|_| anyhow!("messages still pending after 10 seconds"))?;

    println!("pending acknowledgements: {}", client.pending_count());
    println!("dropped messages:         {}", client.dropped_count());

    client.shutdown().await;
    server.shutdown().await;
    client_loop.await??;
    server_loop.await??;
    Ok(())
}
