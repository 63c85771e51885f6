use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::aof::{Aof, AofError};
use crate::codec::FrameCodec;
use crate::commands;
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::registry::Registry;
use crate::store::Store;
use crate::Error;

/// Commands that modify the dataset and therefore get appended to the append-only file.
///
/// The registry has no notion of read-only versus write commands, so this list has to be
/// kept in sync by hand with every handler that mutates the store.
pub const PERSISTED_COMMANDS: &[&str] = &["SET", "HSET"];

/// Starts the server described by `config` and runs it until `shutdown` resolves.
///
/// The append-only file is fully replayed before the first connection is accepted. Once the
/// server stops, every connection is drained before the file is closed.
pub async fn run(config: Config, shutdown: impl Future) -> Result<(), Error> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;

    let aof = Aof::open(&config.aof_path, config.flush_interval()).await?;
    let registry = commands::registry(Store::new());

    match replay(&aof, &registry).await {
        Ok(records) => info!("Loaded {} records from {}", records, aof.path().display()),
        Err(e) => {
            error!("Failed to load {}: {}", aof.path().display(), e);
            aof.close().await?;
            return Err(e.into());
        }
    }

    info!("Redis server listening on {}", listener.local_addr()?);

    let codec = FrameCodec::new(config.max_frame_size);
    let res = serve(listener, aof.clone(), registry, codec, shutdown).await;

    aof.close().await?;
    res
}

/// Feeds every record of the append-only file through the registry, without appending them
/// again. Returns the number of records read.
pub async fn replay(aof: &Aof, registry: &Registry) -> Result<usize, AofError> {
    aof.replay(|frame| {
        let Some((command, args)) = parse_request(&frame) else {
            warn!("Skipping invalid record in append-only file: {}", frame);
            return;
        };

        match registry.lookup(&command) {
            Some(handler) => {
                handler(args);
            }
            None => warn!("Skipping unknown command {} in append-only file", command),
        }
    })
    .await
}

/// Accepts connections on `listener` until `shutdown` resolves.
///
/// On shutdown the listener is closed, every connection is asked to stop before reading its
/// next request, and this function returns once all of them are gone.
pub async fn serve(
    listener: TcpListener,
    aof: Aof,
    registry: Registry,
    codec: FrameCodec,
    shutdown: impl Future,
) -> Result<(), Error> {
    let dispatcher = Dispatcher {
        aof,
        registry: Arc::new(registry),
    };
    let stop = CancellationToken::new();
    let mut connections = JoinSet::new();

    tokio::pin!(shutdown);

    let res = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            accepted = listener.accept() => {
                let (socket, client_address) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => break Err(e),
                };
                info!("Accepted connection from {:?}", client_address);

                let dispatcher = dispatcher.clone();
                let codec = codec.clone();
                let stop = stop.clone();

                connections.spawn(async move {
                    if let Err(e) =
                        handle_connection(socket, client_address, dispatcher, codec, stop).await
                    {
                        error!("Connection error: {}", e);
                    }
                });
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
        }
    };

    drop(listener);
    stop.cancel();

    info!("Waiting for {} connections to close", connections.len());
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!("Connection task failed: {}", e);
        }
    }

    res.map_err(Into::into)
}

#[instrument(
    name = "connection",
    skip_all,
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    dispatcher: Dispatcher,
    codec: FrameCodec,
    stop: CancellationToken,
) -> Result<(), Error> {
    let mut conn = Connection::with_codec(stream, codec);

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    loop {
        let frame = tokio::select! {
            frame = conn.read_frame() => frame?,
            _ = stop.cancelled() => {
                debug!("Server is shutting down");
                break;
            }
        };

        let Some(frame) = frame else {
            break;
        };

        debug!("Received frame from client: {}", frame);

        if let Some(res) = dispatcher.dispatch(frame).await {
            debug!("Sending response to client: {}", res);
            conn.write_frame(res).await?;
        }
    }

    info!("Connection closed");
    Ok(())
}

#[derive(Clone)]
struct Dispatcher {
    aof: Aof,
    registry: Arc<Registry>,
}

impl Dispatcher {
    /// Runs a single request. Returns `None` when the request is malformed, in which case
    /// nothing is sent back to the client.
    async fn dispatch(&self, request: Frame) -> Option<Frame> {
        let Some((command, args)) = parse_request(&request) else {
            info!("Invalid request, expected a non-empty array of bulk strings: {}", request);
            return None;
        };

        let Some(handler) = self.registry.lookup(&command) else {
            info!("Unknown command {}", command);
            return Some(Frame::Simple(String::new()));
        };

        if PERSISTED_COMMANDS.contains(&command.as_str()) {
            if let Err(e) = self.aof.append(&request).await {
                warn!("Failed to append {} to the append-only file: {}", command, e);
            }
        }

        Some(handler(args))
    }
}

/// Splits a request into its upper-cased command name and its arguments.
///
/// Clients send commands as arrays whose first element is a bulk string holding the name.
fn parse_request(frame: &Frame) -> Option<(String, &[Frame])> {
    let Frame::Array(parts) = frame else {
        return None;
    };
    let (Frame::Bulk(name), args) = parts.split_first()? else {
        return None;
    };

    Some((String::from_utf8_lossy(name).to_ascii_uppercase(), args))
}
