use fabric_core::wire::Message;
use fabric_core::rw::{Connection, ConnectionReader, ConnectionWriter};
use tokio::sync::mpsc;

/// Splits a connection into reader/writer tasks and hands back plain
/// channels: send into the returned sender to put a message on the wire,
/// receive from the returned receiver to get messages that arrived on it.
/// Every link a node holds (registry, prev, next) is driven this way.
pub fn spawn_pump(connection: Connection, buf: usize) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
    let (reader, writer) = connection.split();
    let (out_tx, out_rx) = mpsc::channel(buf);
    let (in_tx, in_rx) = mpsc::channel(buf);

    tokio::spawn(write_pump(writer, out_rx));
    tokio::spawn(read_pump(reader, in_tx));

    (out_tx, in_rx)
}

async fn write_pump(mut writer: ConnectionWriter, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = writer.send(&msg).await {
            tracing::warn!(error = ?e, "write pump closing");
            break;
        }
    }
}

async fn read_pump(mut reader: ConnectionReader, tx: mpsc::Sender<Message>) {
    while let Some(msg) = reader.recv().await {
        if tx.send(msg).await.is_err() {
            break;
        }
    }
}
