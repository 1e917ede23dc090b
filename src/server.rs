use std::net::SocketAddr;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, instrument};

use crate::commands::executable::Executable;
use crate::commands::Command;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::store::Store;
use crate::subscriptions::Subscriptions;
use crate::Error;

pub async fn run(listener: TcpListener) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let store = Store::new();
    let subscriptions = Subscriptions::new();

    info!("Server listening on {}", listener.local_addr()?);

    loop {
        let (socket, client_address) = listener.accept().await?;
        let store = store.clone();
        let subscriptions = subscriptions.clone();
        info!("Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client_address, store, subscriptions).await {
                error!("Connection error: {}", e);
            }
        });
    }
}

#[instrument(
    name = "connection",
    skip(stream, store, subscriptions),
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    store: Store,
    subscriptions: Subscriptions,
) -> Result<(), Error> {
    let mut conn = Connection::new(stream);

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    // Published messages destined for this connection arrive here and are
    // interleaved with regular replies by the driver below.
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();

    let result = drive(&mut conn, &store, &subscriptions, &push_tx, &mut push_rx).await;
    subscriptions.remove_session(conn.id);

    info!("Connection closed");
    result
}

async fn drive(
    conn: &mut Connection,
    store: &Store,
    subscriptions: &Subscriptions,
    push_tx: &UnboundedSender<Frame>,
    push_rx: &mut UnboundedReceiver<Frame>,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            maybe_push = push_rx.recv() => {
                // The sender half lives in this scope, so the channel never
                // closes before the loop ends.
                if let Some(frame) = maybe_push {
                    conn.write_frame(&frame).await?;
                }
            }
            maybe_frame = conn.read_frame() => {
                let frame = match maybe_frame? {
                    Some(frame) => frame,
                    None => return Ok(()),
                };
                info!("Received frame from client: {:?}", frame);

                let cmd = match Command::try_from(frame) {
                    Ok(cmd) => cmd,
                    Err(err) => {
                        conn.write_frame(&Frame::Error(format!("ERR {}", err))).await?;
                        continue;
                    }
                };

                apply(conn, store, subscriptions, push_tx, cmd).await?;
            }
        }
    }
}

/// Executes one parsed command. The subscribe family and PUBLISH touch the
/// subscriber registry; everything else goes through the store.
async fn apply(
    conn: &mut Connection,
    store: &Store,
    subscriptions: &Subscriptions,
    push_tx: &UnboundedSender<Frame>,
    cmd: Command,
) -> Result<(), Error> {
    match cmd {
        Command::Subscribe(cmd) => {
            for channel in cmd.channels {
                let count = subscriptions.subscribe(conn.id, push_tx, channel.clone());
                conn.write_frame(&confirmation("subscribe", Some(channel), count))
                    .await?;
            }
        }
        Command::Psubscribe(cmd) => {
            for pattern in cmd.patterns {
                let count = subscriptions.psubscribe(conn.id, push_tx, pattern.clone());
                conn.write_frame(&confirmation("psubscribe", Some(pattern), count))
                    .await?;
            }
        }
        Command::Unsubscribe(cmd) => {
            // Bare UNSUBSCRIBE drops every channel subscription.
            let channels = if cmd.channels.is_empty() {
                subscriptions.channels_of(conn.id)
            } else {
                cmd.channels
            };
            if channels.is_empty() {
                let count = subscriptions.patterns_of(conn.id).len();
                conn.write_frame(&confirmation("unsubscribe", None, count))
                    .await?;
            }
            for channel in channels {
                let count = subscriptions.unsubscribe(conn.id, &channel);
                conn.write_frame(&confirmation("unsubscribe", Some(channel), count))
                    .await?;
            }
        }
        Command::Punsubscribe(cmd) => {
            let patterns = if cmd.patterns.is_empty() {
                subscriptions.patterns_of(conn.id)
            } else {
                cmd.patterns
            };
            if patterns.is_empty() {
                let count = subscriptions.channels_of(conn.id).len();
                conn.write_frame(&confirmation("punsubscribe", None, count))
                    .await?;
            }
            for pattern in patterns {
                let count = subscriptions.punsubscribe(conn.id, &pattern);
                conn.write_frame(&confirmation("punsubscribe", Some(pattern), count))
                    .await?;
            }
        }
        Command::Publish(cmd) => {
            let receivers = subscriptions.publish(&cmd.channel, &cmd.payload);
            conn.write_frame(&Frame::Integer(receivers)).await?;
        }
        cmd => {
            let res = cmd.exec(store.clone())?;
            info!("Sending response to client: {:?}", res);
            conn.write_frame(&res).await?;
        }
    }

    Ok(())
}

fn confirmation(kind: &'static str, name: Option<String>, count: usize) -> Frame {
    Frame::Array(vec![
        Frame::Bulk(Bytes::from(kind)),
        match name {
            Some(name) => Frame::Bulk(Bytes::from(name)),
            None => Frame::NullBulk,
        },
        Frame::Integer(count as i64),
    ])
}
