use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A single-connection mock of the satellite side of the upstream adapter's
/// WebSocket: accepts one client, hands back every text frame it receives as
/// a line, and sends whatever lines the test pushes via [`Self::send_line`]
/// (mirrors this workspace's `MockWsServer`, adapted to the adapter's
/// space-delimited text-line protocol instead of JSON framing).
pub struct MockSatelliteServer {
    addr: SocketAddr,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    outgoing_tx: mpsc::UnboundedSender<String>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockSatelliteServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<String>();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(async move {
            let Ok((stream, _peer)) = listener.accept().await else { return };
            let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else { return };
            let (mut write, mut read) = ws_stream.split();

            loop {
                tokio::select! {
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if incoming_tx.send(text.to_string()).is_err() { break; }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if write.send(Message::Pong(data)).await.is_err() { break; }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break,
                        }
                    }
                    outgoing = outgoing_rx.recv() => {
                        match outgoing {
                            Some(line) => {
                                if write.send(Message::Text(line.into())).await.is_err() { break; }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(Self { addr, incoming_rx: Mutex::new(incoming_rx), outgoing_tx, _task: task })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn send_line(&self, line: impl Into<String>) {
        let _ = self.outgoing_tx.send(line.into());
    }

    pub async fn recv_line(&self) -> Option<String> {
        self.incoming_rx.lock().await.recv().await
    }
}
