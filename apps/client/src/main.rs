mod backoff;
mod input;

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use parley_crypto::{open_envelope, seal_envelope, SymmetricKey};
use parley_protocol::{
    decode_outbound, encode, encode_control, ClientControl, Envelope, MessageType, OutboundFrame,
    RoomId, ServerEvent, Target, TypingState, UserId,
};
use parley_runtime::telemetry;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use backoff::Backoff;
use input::{parse_input, Input};

/// Keepalive well inside the server's default idle timeout.
const PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Parser)]
#[command(name = "parley-client")]
#[command(about = "Chat through a Parley relay from the terminal")]
struct Cli {
    /// WebSocket endpoint of the relay
    #[arg(long, default_value = "ws://127.0.0.1:7070/ws")]
    url: String,

    /// Bearer token, as printed by `parley-server issue-token`
    #[arg(long)]
    token: String,

    /// Rooms to join on every (re)connect
    #[arg(long = "room")]
    rooms: Vec<String>,

    /// Base64 room key; room chat is sealed with it and incoming ciphertext opened
    #[arg(long)]
    key: Option<String>,

    /// Give up after this many consecutive failed connection attempts
    #[arg(long)]
    max_retries: Option<u32>,
}

enum SessionExit {
    Quit,
    Disconnected,
}

struct ClientState {
    rooms: BTreeSet<RoomId>,
    focus: Option<Target>,
    key: Option<SymmetricKey>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing().context("failed to initialise tracing")?;

    let key = cli
        .key
        .as_deref()
        .map(SymmetricKey::from_base64)
        .transpose()
        .context("invalid --key")?;

    let rooms: BTreeSet<RoomId> = cli
        .rooms
        .iter()
        .map(|room| RoomId::from(room.as_str()))
        .collect();
    let mut state = ClientState {
        focus: rooms.iter().next().cloned().map(Target::Room),
        rooms,
        key,
    };

    let url = format!("{}?token={}", cli.url, cli.token);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut backoff = Backoff::default().with_max_attempts(cli.max_retries);

    loop {
        info!(url = %cli.url, "connecting");

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                backoff.reset();
                match run_session(socket, &mut lines, &mut state).await? {
                    SessionExit::Quit => return Ok(()),
                    SessionExit::Disconnected => warn!("connection lost"),
                }
            }
            Err(err) => warn!(error = %err, "connection failed"),
        }

        let Some(delay) = backoff.next_delay() else {
            anyhow::bail!("giving up after {} attempts", backoff.attempts());
        };
        info!(delay_secs = delay.as_secs_f32(), "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn run_session(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    lines: &mut Lines<BufReader<Stdin>>,
    state: &mut ClientState,
) -> Result<SessionExit> {
    let (mut writer, mut reader) = socket.split();

    for room in &state.rooms {
        let join = ClientControl::Join { room: room.clone() };
        writer.send(Message::Text(encode_control(&join))).await?;
    }

    let mut keepalive = tokio::time::interval(PING_INTERVAL);
    keepalive.tick().await;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    let _ = writer.close().await;
                    return Ok(SessionExit::Quit);
                };
                let outgoing = match parse_input(&line) {
                    Ok(Some(Input::Quit)) => {
                        let _ = writer.close().await;
                        return Ok(SessionExit::Quit);
                    }
                    Ok(Some(input)) => outgoing_frame(input, state),
                    Ok(None) => continue,
                    Err(err) => {
                        eprintln!("{err}");
                        continue;
                    }
                };
                match outgoing {
                    Ok(Some(text)) => {
                        if writer.send(Message::Text(text)).await.is_err() {
                            return Ok(SessionExit::Disconnected);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{err:#}"),
                }
            }
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => render(&text, state),
                Some(Ok(Message::Close(_))) | None => return Ok(SessionExit::Disconnected),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "socket error");
                    return Ok(SessionExit::Disconnected);
                }
            },
            _ = keepalive.tick() => {
                let ping = encode_control(&ClientControl::Ping);
                if writer.send(Message::Text(ping)).await.is_err() {
                    return Ok(SessionExit::Disconnected);
                }
            }
        }
    }
}

/// Turn a prompt line into the text frame to send, if any.
fn outgoing_frame(input: Input, state: &mut ClientState) -> Result<Option<String>> {
    let frame = match input {
        Input::Join(room) => {
            state.rooms.insert(room.clone());
            state.focus = Some(Target::Room(room.clone()));
            encode_control(&ClientControl::Join { room })
        }
        Input::Leave(room) => {
            state.rooms.remove(&room);
            if state.focus.as_ref().and_then(Target::room) == Some(&room) {
                state.focus = None;
            }
            encode_control(&ClientControl::Leave { room })
        }
        Input::Focus(target) => {
            println!("* now talking to {target}");
            state.focus = Some(target);
            return Ok(None);
        }
        Input::Typing => {
            let target = focused(state)?;
            encode(&Envelope::new(
                MessageType::Typing,
                target,
                TypingState::Started.as_str(),
            ))
        }
        Input::Say(text) => {
            let target = focused(state)?;
            let envelope = Envelope::chat(target.clone(), text);
            match (&state.key, &target) {
                (Some(key), Target::Room(_)) => {
                    encode(&seal_envelope(envelope, key).context("failed to seal message")?)
                }
                _ => encode(&envelope),
            }
        }
        Input::Quit => return Ok(None),
    };
    Ok(Some(frame))
}

fn focused(state: &ClientState) -> Result<Target> {
    state
        .focus
        .clone()
        .context("no conversation selected; use /join <room> or /to <user>")
}

fn render(text: &str, state: &ClientState) {
    let frame = match decode_outbound(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "unreadable frame from relay");
            return;
        }
    };

    match frame {
        OutboundFrame::Event(ServerEvent::Authenticated { user_id }) => {
            println!("* signed in as {user_id}")
        }
        OutboundFrame::Event(ServerEvent::Joined { room }) => println!("* joined {room}"),
        OutboundFrame::Event(ServerEvent::Left { room }) => println!("* left {room}"),
        OutboundFrame::Event(_) => {}
        OutboundFrame::Envelope(envelope) => {
            let sender = envelope
                .sender
                .as_ref()
                .map(UserId::as_str)
                .unwrap_or("relay");
            match envelope.kind {
                MessageType::Chat => {
                    let body = readable_body(&envelope, state);
                    println!("[{}] {sender}: {body}", envelope.target);
                }
                MessageType::Typing if envelope.content == TypingState::Started.as_str() => {
                    println!("[{}] {sender} is typing...", envelope.target)
                }
                MessageType::Typing => {}
                MessageType::Presence => println!("* {sender} is {}", envelope.content),
                MessageType::Error => eprintln!("! {}", envelope.content),
            }
        }
    }
}

fn readable_body(envelope: &Envelope, state: &ClientState) -> String {
    if !envelope.is_encrypted() {
        return envelope.content.clone();
    }
    match &state.key {
        Some(key) => match open_envelope(envelope, key) {
            Ok(plaintext) => String::from_utf8_lossy(&plaintext).into_owned(),
            Err(err) => format!("<undecryptable: {err}>"),
        },
        None => "<encrypted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::decode;

    fn state(key: Option<SymmetricKey>) -> ClientState {
        ClientState {
            rooms: BTreeSet::new(),
            focus: None,
            key,
        }
    }

    #[test]
    fn chat_needs_a_focused_conversation() {
        let mut state = state(None);
        assert!(outgoing_frame(Input::Say("hi".into()), &mut state).is_err());

        outgoing_frame(Input::Join(RoomId::from("ops")), &mut state).unwrap();
        assert!(state.rooms.contains(&RoomId::from("ops")));

        let text = outgoing_frame(Input::Say("hi".into()), &mut state)
            .unwrap()
            .unwrap();
        let envelope = decode(&text).unwrap();
        assert_eq!(envelope.target, Target::Room(RoomId::from("ops")));
        assert_eq!(envelope.content, "hi");
    }

    #[test]
    fn room_chat_is_sealed_when_a_key_is_set() {
        let key = SymmetricKey::generate();
        let mut state = state(Some(key.clone()));
        state.focus = Some(Target::Room(RoomId::from("ops")));

        let text = outgoing_frame(Input::Say("secret".into()), &mut state)
            .unwrap()
            .unwrap();
        let envelope = decode(&text).unwrap();
        assert!(envelope.is_encrypted());
        assert_ne!(envelope.content, "secret");
        assert_eq!(readable_body(&envelope, &state), "secret");

        state.focus = Some(Target::Direct(UserId::from("bob")));
        let text = outgoing_frame(Input::Say("plain".into()), &mut state)
            .unwrap()
            .unwrap();
        assert!(!decode(&text).unwrap().is_encrypted());
    }

    #[test]
    fn leaving_the_focused_room_clears_focus() {
        let mut state = state(None);
        outgoing_frame(Input::Join(RoomId::from("ops")), &mut state).unwrap();
        outgoing_frame(Input::Leave(RoomId::from("ops")), &mut state).unwrap();
        assert!(state.focus.is_none());
        assert!(state.rooms.is_empty());
    }
}
