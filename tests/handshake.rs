//! End-to-end session tests over localhost: handshake, encrypted command
//! exchange in both directions, broadcast, and teardown on a corrupt
//! frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use lobbynet::config::ServerConfig;
use lobbynet::connection::{self, Connection, ConnectionStatus};
use lobbynet::diffie_hellman::DhParams;
use lobbynet::message::{Message, MessageQueue};
use lobbynet::packet::Packet;
use lobbynet::read_only_packet::{PacketRead, ReadOnlyPacket};
use lobbynet::server::TcpServer;

/// The 1024-bit MODP prime from RFC 2409 (base 2), so tests skip
/// parameter generation.
const TEST_PRIME: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                          020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                          4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                          EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

async fn start_server(
    dh_prime: Option<String>,
) -> anyhow::Result<(Arc<MessageQueue<Message>>, u16)> {
    let queue = Arc::new(MessageQueue::new());
    let mut config = ServerConfig::default_lobby(0);
    config.listen_address = "127.0.0.1".to_string();
    config.dh_prime = dh_prime;

    let server = TcpServer::bind(config, queue.clone()).await?;
    let port = server.local_addr()?.port();
    tokio::spawn(server.run());
    Ok((queue, port))
}

fn dequeue_blocking(
    queue: &Arc<MessageQueue<Message>>,
) -> tokio::task::JoinHandle<Option<Message>> {
    let queue = queue.clone();
    tokio::task::spawn_blocking(move || queue.dequeue_timeout(Duration::from_secs(10)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_key_handshake_and_command_exchange() -> anyhow::Result<()> {
    // No persisted prime: the server generates parameters on the first
    // accept.
    let (server_queue, port) = start_server(None).await?;

    let client_queue = Arc::new(MessageQueue::new());
    let client = Connection::connect("127.0.0.1", port, client_queue.clone()).await?;

    assert!(client.encrypted().await, "handshake did not complete");
    assert_eq!(client.status(), ConnectionStatus::Encrypted);

    // Client to server.
    let mut body = Packet::new();
    connection::write_command(&mut body, 0x1234, b"hello")?;
    client.send_encrypted(&body)?;

    let message = dequeue_blocking(&server_queue)
        .await?
        .expect("no command reached the server");
    assert_eq!(message.command_code, 0x1234);
    assert_eq!(message.packet.const_data(), b"hello");
    assert_eq!(message.connection.status(), ConnectionStatus::Encrypted);

    // Server to client, over the connection the command arrived on.
    let mut reply = Packet::new();
    connection::write_command(&mut reply, 0x4321, b"welcome")?;
    message.connection.send_encrypted(&reply)?;

    let mut reply_message = dequeue_blocking(&client_queue)
        .await?
        .expect("no command reached the client");
    assert_eq!(reply_message.command_code, 0x4321);
    assert_eq!(reply_message.packet.size(), 7);
    assert_eq!(reply_message.packet.read_array(7)?, b"welcome");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiple_commands_in_one_frame() -> anyhow::Result<()> {
    let (server_queue, port) = start_server(Some(TEST_PRIME.to_string())).await?;

    let client_queue = Arc::new(MessageQueue::new());
    let client = Connection::connect("127.0.0.1", port, client_queue).await?;
    assert!(client.encrypted().await);

    let mut body = Packet::new();
    connection::write_command(&mut body, 1, b"first")?;
    connection::write_command(&mut body, 2, b"")?;
    connection::write_command(&mut body, 3, b"third")?;
    client.send_encrypted(&body)?;

    // Commands arrive in wire order.
    for (code, expected) in [(1u16, b"first".as_slice()), (2, b""), (3, b"third")] {
        let message = dequeue_blocking(&server_queue)
            .await?
            .expect("missing command");
        assert_eq!(message.command_code, code);
        assert_eq!(message.packet.const_data(), expected);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_sends_the_same_bytes_to_every_connection() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let parameters = DhParams::load_hex(TEST_PRIME)?;
    let queue = Arc::new(MessageQueue::new());

    let mut peer_a = TcpStream::connect(address).await?;
    let (server_a, _) = listener.accept().await?;
    let mut peer_b = TcpStream::connect(address).await?;
    let (server_b, _) = listener.accept().await?;

    let connections = [
        Connection::accepted(server_a, parameters.clone(), queue.clone()),
        Connection::accepted(server_b, parameters, queue),
    ];

    let mut frame = Packet::new();
    frame.write_array(b"frame")?;
    let frame: ReadOnlyPacket = frame.into();
    connection::broadcast(&connections, &frame);

    // Both sockets see the same bytes; the backing storage is shared,
    // not copied.
    for peer in [&mut peer_a, &mut peer_b] {
        let mut buffer = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut buffer)).await??;
        assert_eq!(&buffer, b"frame");
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_frame_tears_down_the_connection() -> anyhow::Result<()> {
    let (_server_queue, port) = start_server(Some(TEST_PRIME.to_string())).await?;

    let client_queue = Arc::new(MessageQueue::new());
    let client = Connection::connect("127.0.0.1", port, client_queue).await?;
    assert!(client.encrypted().await);

    // A valid envelope around a command whose size field is smaller than
    // its own header.
    let mut body = Packet::new();
    body.write_u16_be(3)?;
    body.write_u16_le(3)?;
    body.write_u16_le(7)?;
    client.send_encrypted(&body)?;

    // The server must drop the connection; the client observes the close.
    tokio::time::timeout(Duration::from_secs(5), client.disconnected())
        .await
        .expect("connection was not torn down");
    assert_eq!(client.status(), ConnectionStatus::NotConnected);

    Ok(())
}
