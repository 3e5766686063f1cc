use crate::transfer::{deserialize, serialize};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type Codec = Framed<TcpStream, LengthDelimitedCodec>;

/// A message-oriented connection: length-delimited frames carrying
/// serialized messages of one receive and one send type.
pub struct Connection<ReceiveMsg, SendMsg> {
    framed: Codec,
    _r: PhantomData<ReceiveMsg>,
    _s: PhantomData<SendMsg>,
}

impl<R: DeserializeOwned, S: Serialize> Connection<R, S> {
    pub async fn connect(addr: SocketAddr) -> crate::Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        Ok(Self::new(socket))
    }

    pub fn new(socket: TcpStream) -> Self {
        let _ = socket.set_nodelay(true);
        Self {
            framed: Framed::new(socket, LengthDelimitedCodec::new()),
            _r: Default::default(),
            _s: Default::default(),
        }
    }

    pub async fn send(&mut self, item: S) -> crate::Result<()> {
        let data = serialize(&item)?;
        self.framed.send(Bytes::from(data)).await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Option<crate::Result<R>> {
        self.framed.next().await.map(|message| {
            message
                .map_err(crate::Error::from)
                .and_then(|frame| deserialize(&frame))
        })
    }

    pub async fn send_and_receive(&mut self, item: S) -> crate::Result<R> {
        self.send(item).await?;
        match self.receive().await {
            Some(message) => message,
            None => Err(crate::Error::GenericError(
                "Expected response was not received".into(),
            )),
        }
    }

    pub async fn shutdown(mut self) -> crate::Result<()> {
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Connection;
    use crate::transfer::messages::{MessageType, ReplyEnvelope, RequestEnvelope};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut connection: Connection<RequestEnvelope, ReplyEnvelope> =
                Connection::new(socket);
            let request = connection.receive().await.unwrap().unwrap();
            assert_eq!(request.msg_type, MessageType::RequestPing);
            connection
                .send(ReplyEnvelope {
                    msg_type: MessageType::ResponseReturnCode,
                    payload: request.payload,
                })
                .await
                .unwrap();
        });

        let mut connection: Connection<ReplyEnvelope, RequestEnvelope> =
            Connection::connect(addr).await.unwrap();
        let reply = connection
            .send_and_receive(RequestEnvelope {
                msg_type: MessageType::RequestPing,
                payload: vec![1, 2, 3],
            })
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::ResponseReturnCode);
        assert_eq!(reply.payload, vec![1, 2, 3]);
        connection.shutdown().await.unwrap();
        server.await.unwrap();
    }
}
