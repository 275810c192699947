use bytes::{Bytes, BytesMut};
use color_eyre::eyre::{Report, WrapErr};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::wire::Message;

/// Length-delimited (4-byte big-endian prefix) duplex connection to a single
/// peer. One `Connection` per TCP socket; reading and writing are both
/// driven by whoever owns it, so in practice a connection is handed to one
/// reader task and, via `split`, one writer task.
#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        Self { framed }
    }

    pub async fn recv(&mut self) -> Option<Message> {
        match self.framed.next().await {
            Some(Ok(bytes)) => Some(deserialize(bytes)),
            Some(Err(e)) => {
                tracing::warn!("[rw] error while reading from stream: {:?}", e);
                None
            }
            None => None,
        }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), Report> {
        let bytes = serialize(msg);
        self.framed
            .send(bytes)
            .await
            .wrap_err("error while sending to sink")
    }

    /// Splits into independent read and write halves so a connection can be
    /// driven by a dedicated reader task and writer task, as the node
    /// binary does for every ring link.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (sink, stream) = self.framed.split();
        (ConnectionReader { stream }, ConnectionWriter { sink })
    }
}

#[derive(Debug)]
pub struct ConnectionReader {
    stream: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl ConnectionReader {
    pub async fn recv(&mut self) -> Option<Message> {
        match self.stream.next().await {
            Some(Ok(bytes)) => Some(deserialize(bytes)),
            Some(Err(e)) => {
                tracing::warn!("[rw] error while reading from stream: {:?}", e);
                None
            }
            None => None,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionWriter {
    sink: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
}

impl ConnectionWriter {
    pub async fn send(&mut self, msg: &Message) -> Result<(), Report> {
        let bytes = serialize(msg);
        self.sink.send(bytes).await.wrap_err("error while sending to sink")
    }
}

fn deserialize(bytes: BytesMut) -> Message {
    bincode::deserialize(&bytes).expect("[rw] deserialize should work")
}

fn serialize(msg: &Message) -> Bytes {
    let bytes = bincode::serialize(msg).expect("[rw] serialize should work");
    Bytes::from(bytes)
}
