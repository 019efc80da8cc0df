use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sporket_protocol::{Message, MessageKind, SessionKey, Status, challenge, payload_object};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A WebSocket client that speaks raw envelopes with no state machine,
/// so tests can forge signatures and drive the handshake by hand.
pub struct RawClient {
    write: futures_util::stream::SplitSink<WsStream, WsFrame>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl RawClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_message(&mut self, msg: &Message) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(msg)?;
        self.send_text(&json).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(WsFrame::Text(text.to_owned().into())).await?;
        Ok(())
    }

    pub async fn recv_message(&mut self) -> Result<Message, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(WsFrame::Text(text))) => {
                    let msg: Message = serde_json::from_str(&text)?;
                    return Ok(msg);
                }
                Some(Ok(WsFrame::Ping(_))) | Some(Ok(WsFrame::Pong(_))) => continue,
                Some(Ok(WsFrame::Close(_))) => return Err("connection closed by peer".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Drain frames until the peer closes the connection. True when the
    /// close arrives within the caller's patience (enforce with a
    /// surrounding timeout).
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match self.read.next().await {
                Some(Ok(WsFrame::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(WsFrame::Close(None)).await?;
        Ok(())
    }

    /// Run the full client half of the handshake with the given password:
    /// receive the greeting, derive the key from the payload uuid, verify,
    /// answer the challenge, and require the success marker.
    ///
    /// Returns the session uuid and derived key for later signed sends.
    pub async fn authenticate(
        &mut self,
        password: &str,
    ) -> Result<(String, SessionKey), Box<dyn std::error::Error>> {
        let (uuid, key) = self.read_greeting().await?;
        let reply = self.answer_challenge(password, &uuid, &key).await?;
        let accepted = reply.kind == MessageKind::Auth
            && reply.parse_payload().get("success").and_then(Value::as_bool) == Some(true);
        if !accepted {
            return Err(format!(
                "authentication rejected: kind {:?} status {:?}",
                reply.kind, reply.status
            )
            .into());
        }
        Ok((uuid, key))
    }

    /// Receive and verify the identity announcement, returning the
    /// session uuid and the key derived from it.
    pub async fn read_greeting(
        &mut self,
    ) -> Result<(String, SessionKey), Box<dyn std::error::Error>> {
        let greeting = self.recv_message().await?;
        let payload = greeting.parse_payload();
        let uuid = payload
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or("greeting missing uuid")?
            .to_owned();
        let key = SessionKey::derive(&uuid);
        if !greeting.verify(Some(&key)) {
            return Err("greeting signature invalid".into());
        }
        Ok((uuid, key))
    }

    /// Send the challenge computed from the given password and return the
    /// server's verdict frame.
    pub async fn answer_challenge(
        &mut self,
        password: &str,
        uuid: &str,
        key: &SessionKey,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let proof = challenge(password, uuid);
        let answer = Message::new(
            &payload_object(json!({ "challenge": proof })),
            MessageKind::Auth,
            Status::Ok,
        )
        .sign(key);
        self.send_message(&answer).await?;
        self.recv_message().await
    }
}
