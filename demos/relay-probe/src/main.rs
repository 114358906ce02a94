//! Manual smoke test: start a relay in-process, create a room, attach two
//! wire clients, and relay one message between them.
//!
//! ```sh
//! cargo run -p relay-probe
//! ```

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use roomcast::prelude::*;
use roomcast_protocol as proto;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let server = RelayServer::builder()
        .bind("127.0.0.1:0")
        .app("probe")
        .build()
        .await?;
    let addr = server.local_addr()?.to_string();
    let repo = server.repository();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let created = repo
        .create(RoomOption::default(), ClientInfo::new("alice"))
        .await?;
    let room = created.room_info.id.clone();
    tracing::info!(%room, "room created");

    let _joined = repo.join(&room, ClientInfo::new("bob")).await?;

    let mut alice = connect(&addr, &room, "alice").await?;
    let mut bob = connect(&addr, &room, "bob").await?;

    // Alice says hello; both ends should observe the relayed event.
    let frame = proto::marshal_msg(
        &created.mac_key,
        proto::MsgType::Broadcast,
        1,
        b"hello bob",
    );
    alice.send(Message::Binary(frame.into())).await?;

    print_events("alice", &mut alice, 4).await?;
    print_events("bob", &mut bob, 4).await?;

    Ok(())
}

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(
    addr: &str,
    room: &RoomId,
    user: &str,
) -> Result<Ws, Box<dyn std::error::Error>> {
    let mut request = format!("ws://{addr}/room/{room}").into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("X-Roomcast-App", "probe".parse()?);
    headers.insert("X-Roomcast-User", user.parse()?);
    headers.insert("X-Roomcast-LastEventSeq", "0".parse()?);
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

async fn print_events(
    who: &str,
    ws: &mut Ws,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    for _ in 0..count {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
            .await;
        let Ok(Some(Ok(Message::Binary(data)))) = msg else {
            break;
        };
        match proto::unmarshal_event(&data)? {
            proto::Event::System(ev) => {
                tracing::info!(who, ev = %ev.ev_type(), "system event");
            }
            proto::Event::Regular { event, seq } => {
                tracing::info!(who, ev = %event.ev_type(), seq, "event");
            }
        }
    }
    Ok(())
}
