// Session drivers
//
// Each session runs on its own tokio task that owns the engine outright.
// The application talks to it through a bounded command channel; every
// command carries a oneshot for its reply. Connection events flow back on
// a separate bounded channel and are dropped with a warning when the
// application falls behind.
//
// Shutdown through a handle is graceful: the close goes out with the next
// queries (client) or answers (server) and the driver keeps running until
// the engine reports it, bounded by a drain timeout. Signals on the server
// skip the drain.

use super::client::{ClientOptions, ClientSession};
use super::connection::StreamRead;
use super::server::{ServerOptions, ServerSession};
use super::{ConnectionEvent, SessionStats};
use crate::dns::DnsSocket;
use crate::engine::{ConnHandle, QuicEngine, StreamId};
use crate::{Result, TunnelError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const INBOUND_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;
const IDLE_GC_INTERVAL: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(30);
/// How long a handle-initiated shutdown waits for peers to see the close
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Open {
        cnx: Option<ConnHandle>,
        stream: Option<StreamId>,
        reply: oneshot::Sender<Result<StreamId>>,
    },
    Read {
        cnx: Option<ConnHandle>,
        stream: StreamId,
        reply: oneshot::Sender<Result<StreamRead>>,
    },
    Write {
        cnx: Option<ConnHandle>,
        stream: StreamId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Finish {
        cnx: Option<ConnHandle>,
        stream: StreamId,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseConnection {
        cnx: Option<ConnHandle>,
        code: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
struct Commands(mpsc::Sender<Command>);

impl Commands {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.0
            .send(make(reply))
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        response.await.map_err(|_| TunnelError::SessionClosed)
    }
}

/// Application side of a client session
#[derive(Clone)]
pub struct ClientHandle {
    commands: Commands,
}

impl ClientHandle {
    /// Open the next client-initiated stream
    pub async fn open_stream(&self) -> Result<StreamId> {
        self.commands
            .request(|reply| Command::Open {
                cnx: None,
                stream: None,
                reply,
            })
            .await?
    }

    pub async fn open_or_get_stream(&self, stream: StreamId) -> Result<StreamId> {
        self.commands
            .request(|reply| Command::Open {
                cnx: None,
                stream: Some(stream),
                reply,
            })
            .await?
    }

    /// Drain what has arrived on `stream`; never waits for data
    pub async fn read(&self, stream: StreamId) -> Result<StreamRead> {
        self.commands
            .request(|reply| Command::Read {
                cnx: None,
                stream,
                reply,
            })
            .await?
    }

    pub async fn write(&self, stream: StreamId, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        self.commands
            .request(|reply| Command::Write {
                cnx: None,
                stream,
                data,
                reply,
            })
            .await?
    }

    /// Send FIN on `stream`
    pub async fn finish(&self, stream: StreamId) -> Result<()> {
        self.commands
            .request(|reply| Command::Finish {
                cnx: None,
                stream,
                reply,
            })
            .await?
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.commands.request(|reply| Command::Stats { reply }).await
    }

    /// Close the connection and stop the driver
    ///
    /// Returns once the engine reports the close, or after the drain timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .request(|reply| Command::Shutdown { reply })
            .await
    }
}

/// Application side of a server session
#[derive(Clone)]
pub struct ServerHandle {
    commands: Commands,
}

impl ServerHandle {
    pub async fn open_or_get_stream(&self, cnx: ConnHandle, stream: StreamId) -> Result<StreamId> {
        self.commands
            .request(|reply| Command::Open {
                cnx: Some(cnx),
                stream: Some(stream),
                reply,
            })
            .await?
    }

    pub async fn read(&self, cnx: ConnHandle, stream: StreamId) -> Result<StreamRead> {
        self.commands
            .request(|reply| Command::Read {
                cnx: Some(cnx),
                stream,
                reply,
            })
            .await?
    }

    pub async fn write(&self, cnx: ConnHandle, stream: StreamId, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        self.commands
            .request(|reply| Command::Write {
                cnx: Some(cnx),
                stream,
                data,
                reply,
            })
            .await?
    }

    pub async fn finish(&self, cnx: ConnHandle, stream: StreamId) -> Result<()> {
        self.commands
            .request(|reply| Command::Finish {
                cnx: Some(cnx),
                stream,
                reply,
            })
            .await?
    }

    pub async fn close_connection(&self, cnx: ConnHandle, code: u64) -> Result<()> {
        self.commands
            .request(|reply| Command::CloseConnection {
                cnx: Some(cnx),
                code,
                reply,
            })
            .await?
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.commands.request(|reply| Command::Stats { reply }).await
    }

    /// Close every connection, wait for the peers to see it, then stop the driver
    ///
    /// Connections still open when the drain timeout expires are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .request(|reply| Command::Shutdown { reply })
            .await
    }
}

pub struct ClientTunnel {
    pub handle: ClientHandle,
    pub events: mpsc::Receiver<ConnectionEvent>,
    pub local_addr: SocketAddr,
    pub task: JoinHandle<Result<()>>,
}

pub struct ServerTunnel {
    pub handle: ServerHandle,
    pub events: mpsc::Receiver<ConnectionEvent>,
    pub local_addr: SocketAddr,
    pub task: JoinHandle<Result<()>>,
}

/// Bind `bind`, start the handshake and spawn the client driver
pub async fn spawn_client<E>(engine: E, options: ClientOptions, bind: SocketAddr) -> Result<ClientTunnel>
where
    E: QuicEngine + 'static,
{
    let socket = DnsSocket::bind(bind).await?;
    let local_addr = socket.local_addr()?;
    let session = ClientSession::new(engine, options, local_addr)?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let task = tokio::spawn(run_client(session, socket, command_rx, event_tx));

    Ok(ClientTunnel {
        handle: ClientHandle {
            commands: Commands(command_tx),
        },
        events: event_rx,
        local_addr,
        task,
    })
}

/// Bind `listen` and spawn the server driver
///
/// With `handle_signals`, Ctrl-C drops every connection and stops the task.
pub async fn spawn_server<E>(
    engine: E,
    options: ServerOptions,
    listen: SocketAddr,
    handle_signals: bool,
) -> Result<ServerTunnel>
where
    E: QuicEngine + 'static,
{
    let socket = DnsSocket::bind(listen).await?;
    let local_addr = socket.local_addr()?;
    let session = ServerSession::new(engine, options, local_addr)?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let task = tokio::spawn(run_server(
        session,
        socket,
        command_rx,
        event_tx,
        handle_signals,
    ));

    Ok(ServerTunnel {
        handle: ServerHandle {
            commands: Commands(command_tx),
        },
        events: event_rx,
        local_addr,
        task,
    })
}

fn forward_event(events: &mpsc::Sender<ConnectionEvent>, event: ConnectionEvent) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => {
            log::warn!("Event queue full, dropping {:?}", event);
        }
    }
}

async fn send_queries<E: QuicEngine>(session: &mut ClientSession<E>, socket: &DnsSocket) -> Result<()> {
    for query in session.prepare_queries()? {
        if !socket.send_to(&query.packet, query.dest).await? {
            session.on_send_failed(&query);
        }
    }
    Ok(())
}

fn client_command<E: QuicEngine>(session: &mut ClientSession<E>, command: Command) {
    match command {
        Command::Open { stream, reply, .. } => {
            let id = match stream {
                Some(id) => {
                    session.open_or_get_stream(id);
                    id
                }
                None => session.open_stream(),
            };
            let _ = reply.send(Ok(id));
        }
        Command::Read { stream, reply, .. } => {
            let _ = reply.send(session.read(stream));
        }
        Command::Write {
            stream, data, reply, ..
        } => {
            let _ = reply.send(session.write(stream, &data));
        }
        Command::Finish { stream, reply, .. } => {
            let _ = reply.send(session.finish(stream));
        }
        Command::CloseConnection { code, reply, .. } => {
            let _ = reply.send(session.close(code));
        }
        Command::Stats { reply } => {
            let _ = reply.send(session.stats().clone());
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

/// Start a graceful close, or drop the connection when there is no peer to tell
fn begin_client_close<E: QuicEngine>(session: &mut ClientSession<E>) {
    if !session.is_ready() {
        session.abort();
        return;
    }
    if let Err(e) = session.close(0) {
        log::debug!("Close failed ({}), aborting", e);
        session.abort();
    }
}

async fn run_client<E: QuicEngine>(
    mut session: ClientSession<E>,
    socket: DnsSocket,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let mut inbound = socket.spawn_receiver(INBOUND_QUEUE);
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    let mut shutdown_replies = Vec::new();
    let mut drain_deadline: Option<Instant> = None;
    let mut commands_open = true;

    loop {
        send_queries(&mut session, &socket).await?;
        while let Some(event) = session.poll_event() {
            forward_event(&events, event);
        }
        if session.is_closed() {
            break;
        }
        if drain_deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            log::warn!("Close not acknowledged within {:?}, aborting", SHUTDOWN_DRAIN_TIMEOUT);
            session.abort();
            while let Some(event) = session.poll_event() {
                forward_event(&events, event);
            }
            break;
        }

        let mut wait = session.next_wait();
        if let Some(deadline) = drain_deadline {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        tokio::select! {
            datagram = inbound.recv() => {
                let Some(datagram) = datagram else {
                    log::warn!("DNS socket closed");
                    break;
                };
                session.handle_response(&datagram.data, datagram.peer)?;
                while let Ok(datagram) = inbound.try_recv() {
                    session.handle_response(&datagram.data, datagram.peer)?;
                }
            }
            command = commands.recv(), if commands_open => match command {
                Some(Command::Shutdown { reply }) => {
                    shutdown_replies.push(reply);
                    if drain_deadline.is_none() {
                        begin_client_close(&mut session);
                        drain_deadline = Some(Instant::now() + SHUTDOWN_DRAIN_TIMEOUT);
                    }
                }
                Some(command) => client_command(&mut session, command),
                None => {
                    log::debug!("All client handles dropped, closing");
                    commands_open = false;
                    if drain_deadline.is_none() {
                        begin_client_close(&mut session);
                        drain_deadline = Some(Instant::now() + SHUTDOWN_DRAIN_TIMEOUT);
                    }
                }
            },
            _ = tokio::time::sleep(wait) => {}
            _ = stats_tick.tick() => {
                log::debug!("client stats {}", session.stats().to_json());
            }
        }
    }

    log::info!("Client session finished: {}", session.stats().to_json());
    for reply in shutdown_replies {
        let _ = reply.send(());
    }
    Ok(())
}

fn server_command<E: QuicEngine>(session: &mut ServerSession<E>, command: Command) {
    let missing = || TunnelError::InvalidCommand("server commands need a connection");
    match command {
        Command::Open {
            cnx, stream, reply, ..
        } => {
            let result = match (cnx, stream) {
                (Some(cnx), Some(stream)) => session.open_or_get_stream(cnx, stream).map(|_| stream),
                _ => Err(missing()),
            };
            let _ = reply.send(result);
        }
        Command::Read { cnx, stream, reply } => {
            let _ = reply.send(cnx.ok_or_else(missing).and_then(|cnx| session.read(cnx, stream)));
        }
        Command::Write {
            cnx,
            stream,
            data,
            reply,
        } => {
            let result = cnx
                .ok_or_else(missing)
                .and_then(|cnx| session.write(cnx, stream, &data));
            let _ = reply.send(result);
        }
        Command::Finish { cnx, stream, reply } => {
            let _ = reply.send(cnx.ok_or_else(missing).and_then(|cnx| session.finish(cnx, stream)));
        }
        Command::CloseConnection { cnx, code, reply } => {
            let result = cnx
                .ok_or_else(missing)
                .and_then(|cnx| session.close_connection(cnx, code));
            let _ = reply.send(result);
        }
        Command::Stats { reply } => {
            let _ = reply.send(session.stats().clone());
        }
        Command::Shutdown { reply } => {
            session.begin_shutdown();
            let _ = reply.send(());
        }
    }
}

/// Ctrl-C and SIGTERM listeners for the server driver
struct TerminationSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl TerminationSignal {
    /// Install the handlers now, so a signal raised before the first wait is kept
    fn listen() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            sigterm: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Ctrl-C, or SIGTERM on unix
    async fn recv(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result,
                _ = self.sigterm.recv() => {
                    log::info!("Received SIGTERM");
                    Ok(())
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await
        }
    }
}

async fn run_server<E: QuicEngine>(
    mut session: ServerSession<E>,
    socket: DnsSocket,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    handle_signals: bool,
) -> Result<()> {
    let mut inbound = socket.spawn_receiver(INBOUND_QUEUE);
    let mut gc_tick = tokio::time::interval(IDLE_GC_INTERVAL);
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);

    let (signal_tx, mut signal_rx) = oneshot::channel::<()>();
    if handle_signals {
        match TerminationSignal::listen() {
            Ok(mut signal) => {
                tokio::spawn(async move {
                    match signal.recv().await {
                        Ok(()) => {
                            let _ = signal_tx.send(());
                        }
                        Err(e) => log::warn!("Failed to wait for termination signals: {}", e),
                    }
                });
            }
            Err(e) => log::warn!("Failed to listen for termination signals: {}", e),
        }
    }
    let mut signals_armed = handle_signals;
    let mut commands_open = true;
    let mut shutdown_replies = Vec::new();
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if session.is_drained() {
            log::info!("All connections drained");
            break;
        }
        let drain_wait = drain_deadline.map_or(Duration::ZERO, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });

        tokio::select! {
            datagram = inbound.recv() => {
                let Some(datagram) = datagram else {
                    log::warn!("DNS socket closed");
                    break;
                };
                if let Some(response) = session.handle_query(&datagram.data, datagram.peer) {
                    socket.send_to(&response, datagram.peer).await?;
                }
            }
            command = commands.recv(), if commands_open => match command {
                Some(Command::Shutdown { reply }) => {
                    shutdown_replies.push(reply);
                    if drain_deadline.is_none() {
                        session.begin_shutdown();
                        drain_deadline = Some(Instant::now() + SHUTDOWN_DRAIN_TIMEOUT);
                    }
                }
                Some(command) => server_command(&mut session, command),
                None => commands_open = false,
            },
            _ = tokio::time::sleep(drain_wait), if drain_deadline.is_some() => {
                log::warn!(
                    "{} connection(s) still open after {:?}, dropping them",
                    session.connections().len(),
                    SHUTDOWN_DRAIN_TIMEOUT
                );
                session.shutdown();
                drain_events(&mut session, &events);
                break;
            }
            _ = gc_tick.tick() => {
                session.collect_idle();
            }
            _ = stats_tick.tick() => {
                log::debug!("server stats {}", session.stats().to_json());
            }
            signal = &mut signal_rx, if signals_armed => {
                signals_armed = false;
                if signal.is_ok() {
                    log::info!("Interrupted, dropping all connections");
                    session.shutdown();
                    drain_events(&mut session, &events);
                    break;
                }
            }
        }
        drain_events(&mut session, &events);
    }

    drain_events(&mut session, &events);
    log::info!("Server session finished: {}", session.stats().to_json());
    for reply in shutdown_replies {
        let _ = reply.send(());
    }
    Ok(())
}

fn drain_events<E: QuicEngine>(session: &mut ServerSession<E>, events: &mpsc::Sender<ConnectionEvent>) {
    while let Some(event) = session.poll_event() {
        forward_event(events, event);
    }
}
