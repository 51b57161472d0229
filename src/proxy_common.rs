use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Copies everything from `read_conn` to `write_conn`, then half-closes
/// `write_conn`. Returns the number of bytes relayed.
///
/// `label` names the direction in log output, e.g. "client -> upstream".
pub async fn proxy_conn<R, W>(read_conn: &mut R, write_conn: &mut W, label: &str) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; RELAY_BUF_SIZE];
    let mut relayed = 0u64;

    let result = loop {
        // proxy from the read connection to the write connection
        match read_conn.read(&mut buf).await {
            Ok(0) => {
                debug!(direction = label, relayed, "read connection closed");
                break Ok(relayed);
            }
            Ok(n) => {
                if let Err(e) = write_conn.write_all(&buf[..n]).await {
                    warn!(direction = label, error = %e, "error sending to write connection");
                    break Err(e);
                }
                if let Err(e) = write_conn.flush().await {
                    warn!(direction = label, error = %e, "error flushing write connection");
                    break Err(e);
                }
                relayed += n as u64;
            }
            Err(e) => {
                warn!(direction = label, error = %e, "socket error");
                break Err(e);
            }
        }
    };

    if let Err(e) = write_conn.shutdown().await {
        debug!(direction = label, error = %e, "error shutting down write connection");
    }
    result
}

#[cfg(test)]
mod tests {
    use crate::compression::StreamCompress;
    use crate::config::{CodecOptions, Role};
    use crate::proxy_common::proxy_conn;
    use tokio;
    use tokio::io::{split, AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct TestProxy {
        reader: TcpStream,
        writer: TcpStream,
    }

    /// Helper function to create proxied tcp connections. The connection the
    /// proxy reads from is wrapped in `role`, if any. Returns the connections
    /// to write to the proxy and read from the proxy respectively.
    async fn setup_proxy(role: Option<Role>) -> TestProxy {
        let in_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let out_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let in_send_conn = TcpStream::connect(in_listener.local_addr().unwrap())
            .await
            .unwrap();
        let (in_recv_conn, _) = in_listener.accept().await.unwrap();

        let mut out_send_conn = TcpStream::connect(out_listener.local_addr().unwrap())
            .await
            .unwrap();
        let (out_recv_conn, _) = out_listener.accept().await.unwrap();

        tokio::spawn(async move {
            match role {
                Some(role) => {
                    let factory = StreamCompress::from_options(CodecOptions::default(), role);
                    let wrapped = factory.wrap(in_recv_conn).unwrap();
                    let (mut in_recv_read, _in_recv_write) = split(wrapped);
                    proxy_conn(&mut in_recv_read, &mut out_send_conn, "test").await
                }
                None => {
                    let (mut in_recv_read, _) = split(in_recv_conn);
                    proxy_conn(&mut in_recv_read, &mut out_send_conn, "test").await
                }
            }
        });

        TestProxy {
            reader: in_send_conn,
            writer: out_recv_conn,
        }
    }

    #[tokio::test]
    async fn proxy_content() {
        let message = "Hello world! This is message should be proxied.".as_bytes();
        let mut received = Vec::new();

        let mut test_proxy = setup_proxy(None).await;

        test_proxy.reader.write_all(&message).await.unwrap();
        test_proxy.reader.shutdown().await.unwrap();
        test_proxy.writer.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn proxy_compressed_content() {
        let message = "Hello world! This is message should be proxied and compressed.".as_bytes();
        let mut received = Vec::new();

        let mut test_proxy = setup_proxy(Some(Role::Encode)).await;

        test_proxy.reader.write_all(&message).await.unwrap();
        test_proxy.reader.shutdown().await.unwrap();
        test_proxy.writer.read_to_end(&mut received).await.unwrap();

        assert_ne!(received, message);
        assert_eq!(zstd::decode_all(&received[..]).unwrap(), message);
    }

    #[tokio::test]
    async fn proxy_large_compressed_content() {
        let message = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Nullam risus metus, vulputate sed erat non, maximus accumsan augue. "
            .repeat(1000);
        let mut received = Vec::new();

        let mut test_proxy = setup_proxy(Some(Role::Encode)).await;

        test_proxy.reader.write_all(message.as_bytes()).await.unwrap();
        test_proxy.reader.shutdown().await.unwrap();
        test_proxy.writer.read_to_end(&mut received).await.unwrap();

        assert!(received.len() < message.len());
        assert_eq!(zstd::decode_all(&received[..]).unwrap(), message.as_bytes());
    }

    #[tokio::test]
    async fn proxy_decompressed_content() {
        let message = "Hello world! This is message should be proxied and decompressed.".as_bytes();
        let compressed_message = zstd::encode_all(&message[..], 3).unwrap();
        let mut received = Vec::new();

        let mut test_proxy = setup_proxy(Some(Role::Decode)).await;

        test_proxy
            .reader
            .write_all(&compressed_message)
            .await
            .unwrap();
        test_proxy.reader.shutdown().await.unwrap();
        test_proxy.writer.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn proxy_decompressed_frames() {
        let message = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Nullam risus metus, vulputate sed erat non, maximus accumsan augue. "
            .repeat(100);

        // consecutive frames decode into one continuous stream
        let compressed_messages = message
            .as_bytes()
            .chunks(1024)
            .map(|chunk| zstd::encode_all(chunk, 3).unwrap());

        let mut received = Vec::new();

        let mut test_proxy = setup_proxy(Some(Role::Decode)).await;

        for msg in compressed_messages {
            test_proxy.reader.write_all(&msg).await.unwrap();
        }
        test_proxy.reader.shutdown().await.unwrap();
        test_proxy.writer.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, message.as_bytes());
    }
}
