//! Engine assembly: listener, background event loop, per-connection
//! tasks, and the main-thread pump.
//!
//! The background thread runs a single-threaded tokio runtime inside a
//! `LocalSet`; every socket, parser, and frame lives there and never
//! crosses threads. The embedder's main thread owns the [`Handler`] and
//! drains its callback queue via [`Server::poll`]. The two
//! [`TaskQueue`]s are the only channel between the threads; connections
//! are referenced from the main thread by numeric id, never by pointer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::{debug, warn};

use crate::conn::{ConnEvent, ConnId, Connection};
use crate::error::{Error, Result};
use crate::exec::queue::{CondvarWaker, NotifyWaker, TaskQueue, Wake};
use crate::exec::role::{self, defer_drop, register_role, Role};
use crate::http::{Request, Response};
use crate::io::writer;
use crate::{Config, Endpoint, RECV_BUFFER_SIZE};

/// Application boundary. All methods run on the main thread and must not
/// block indefinitely; a slow handler stalls only its own connection's
/// response, never the event loop.
pub trait Handler: 'static {
    /// Handle a complete HTTP request and produce its response.
    fn on_request(&mut self, request: Request) -> Response;

    /// A WebSocket session opened.
    fn on_ws_open(&mut self, ws: WsHandle) {
        let _ = ws;
    }

    /// A complete WebSocket message arrived.
    fn on_ws_message(&mut self, ws: WsHandle, binary: bool, data: Bytes) {
        let _ = (ws, binary, data);
    }

    /// A WebSocket session closed. Fires exactly once per session.
    fn on_ws_close(&mut self, ws: WsHandle) {
        let _ = ws;
    }
}

/// Main-thread pump state handed to queued callbacks.
pub(crate) struct MainCtx {
    pub(crate) handler: Box<dyn Handler>,
}

/// Cheap cloneable handle to an upgraded connection.
///
/// Safe to hold and use from the main thread; sends cross to the
/// background thread through the engine queue and are dropped silently
/// when the connection is already gone.
#[derive(Clone)]
pub struct WsHandle {
    id: ConnId,
    engine: Arc<TaskQueue<EngineCore>>,
}

impl WsHandle {
    /// Numeric connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a text message for this session.
    pub fn send_text(&self, text: impl Into<String>) {
        let data = Bytes::from(text.into());
        let id = self.id;
        self.engine
            .push(move |core| core.command(id, ConnCmd::WsSend { binary: false, data }));
    }

    /// Queue a binary message for this session.
    pub fn send_binary(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let id = self.id;
        self.engine
            .push(move |core| core.command(id, ConnCmd::WsSend { binary: true, data }));
    }

    /// Close the underlying connection.
    pub fn close(&self) {
        let id = self.id;
        self.engine.push(move |core| core.command(id, ConnCmd::Close));
    }
}

impl std::fmt::Debug for WsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsHandle").field("id", &self.id).finish()
    }
}

/// Command routed from the engine queue to one connection's task.
enum ConnCmd {
    Respond(Response),
    WsSend { binary: bool, data: Bytes },
    Close,
}

/// Background-loop state reachable from queued closures: the connection
/// registry, keyed by id.
pub(crate) struct EngineCore {
    conns: HashMap<ConnId, mpsc::UnboundedSender<ConnCmd>>,
}

impl EngineCore {
    fn command(&mut self, id: ConnId, cmd: ConnCmd) {
        // A send to a finished connection is not an error; the peer may
        // have vanished while the command crossed threads.
        if let Some(tx) = self.conns.get(&id) {
            let _ = tx.send(cmd);
        }
    }

    fn deregister(&mut self, id: ConnId) {
        self.conns.remove(&id);
    }
}

/// Context shared by all connection tasks on the background thread.
struct Shared {
    config: Config,
    main_queue: Arc<TaskQueue<MainCtx>>,
    engine_queue: Arc<TaskQueue<EngineCore>>,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

enum Accepted {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Listener {
    async fn bind(endpoint: &Endpoint) -> io::Result<(Self, Option<SocketAddr>)> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let addr = listener.local_addr()?;
                Ok((Listener::Tcp(listener), Some(addr)))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                // A stale socket file from a previous run blocks the bind.
                let _ = std::fs::remove_file(path);
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok((Listener::Unix(listener), None))
            }
        }
    }

    async fn accept(&self) -> io::Result<(Accepted, Option<String>, Option<String>)> {
        match self {
            Listener::Tcp(listener) => {
                let (sock, peer) = listener.accept().await?;
                let local = sock.local_addr().ok().map(|a| a.to_string());
                let _ = sock.set_nodelay(true);
                Ok((Accepted::Tcp(sock), Some(peer.to_string()), local))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (sock, _) = listener.accept().await?;
                Ok((Accepted::Unix(sock), None, None))
            }
        }
    }
}

/// The embedded server engine.
///
/// Created on the embedder's main thread; the network loop runs on a
/// dedicated background thread until [`Server::shutdown`].
pub struct Server {
    ctx: MainCtx,
    main_queue: Arc<TaskQueue<MainCtx>>,
    main_drop_queue: Arc<TaskQueue<()>>,
    main_waker: Arc<CondvarWaker>,
    #[allow(dead_code)]
    engine_queue: Arc<TaskQueue<EngineCore>>,
    shutdown: Arc<Notify>,
    local_addr: Option<SocketAddr>,
    io_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listener and start the background I/O thread.
    ///
    /// The calling thread becomes the engine's main thread.
    pub fn bind(config: Config, handler: impl Handler) -> Result<Self> {
        register_role(Role::Main);

        let main_waker = Arc::new(CondvarWaker::new());
        let main_queue: Arc<TaskQueue<MainCtx>> =
            Arc::new(TaskQueue::new(main_waker.clone() as Arc<dyn Wake>));
        let main_drop_queue: Arc<TaskQueue<()>> =
            Arc::new(TaskQueue::new(main_waker.clone() as Arc<dyn Wake>));
        role::install_drop_queue(Role::Main, main_drop_queue.clone());

        let engine_notify = Arc::new(Notify::new());
        let engine_queue: Arc<TaskQueue<EngineCore>> = Arc::new(TaskQueue::new(Arc::new(
            NotifyWaker(engine_notify.clone()),
        ) as Arc<dyn Wake>));
        let bg_drop_queue: Arc<TaskQueue<()>> = Arc::new(TaskQueue::new(Arc::new(NotifyWaker(
            engine_notify.clone(),
        )) as Arc<dyn Wake>));
        role::install_drop_queue(Role::Background, bg_drop_queue.clone());

        let shutdown = Arc::new(Notify::new());
        let (bound_tx, bound_rx) = std::sync::mpsc::channel();

        let io_thread = {
            let config = config.clone();
            let main_queue = main_queue.clone();
            let engine_queue = engine_queue.clone();
            let engine_notify = engine_notify.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("sockline-io".into())
                .spawn(move || {
                    register_role(Role::Background);
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_io()
                        .enable_time()
                        .build()
                        .expect("build background runtime");
                    let local = LocalSet::new();
                    rt.block_on(local.run_until(background_loop(
                        config,
                        main_queue,
                        engine_queue,
                        bg_drop_queue,
                        engine_notify,
                        shutdown,
                        bound_tx,
                    )));
                })
                .map_err(Error::Io)?
        };

        let local_addr = match bound_rx.recv() {
            Ok(Ok(addr)) => addr,
            Ok(Err(err)) => {
                let _ = io_thread.join();
                return Err(Error::Io(err));
            }
            Err(_) => {
                let _ = io_thread.join();
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "background thread died during bind",
                )));
            }
        };

        Ok(Self {
            ctx: MainCtx {
                handler: Box::new(handler),
            },
            main_queue,
            main_drop_queue,
            main_waker,
            engine_queue,
            shutdown,
            local_addr,
            io_thread: Some(io_thread),
        })
    }

    /// The bound TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Drain pending application callbacks without blocking.
    pub fn poll(&mut self) {
        self.main_queue.flush(&mut self.ctx);
        self.main_drop_queue.flush(&mut ());
    }

    /// Block up to `timeout` waiting for work, then drain.
    pub fn pump(&mut self, timeout: Duration) {
        self.main_waker.wait(timeout);
        self.poll();
    }

    /// Stop the background loop, join the I/O thread, and drain any
    /// callbacks still queued toward the main thread.
    pub fn shutdown(&mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        self.poll();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn background_loop(
    config: Config,
    main_queue: Arc<TaskQueue<MainCtx>>,
    engine_queue: Arc<TaskQueue<EngineCore>>,
    drop_queue: Arc<TaskQueue<()>>,
    notify: Arc<Notify>,
    shutdown: Arc<Notify>,
    bound_tx: std::sync::mpsc::Sender<io::Result<Option<SocketAddr>>>,
) {
    let (listener, local_addr) = match Listener::bind(&config.endpoint).await {
        Ok(bound) => bound,
        Err(err) => {
            let _ = bound_tx.send(Err(err));
            return;
        }
    };
    let _ = bound_tx.send(Ok(local_addr));

    let queue = engine_queue.clone();
    let shared = Rc::new(Shared {
        config,
        main_queue,
        engine_queue,
    });
    let mut core = EngineCore {
        conns: HashMap::new(),
    };
    let mut next_id: ConnId = 1;

    loop {
        tokio::select! {
            _ = notify.notified() => {
                queue.flush(&mut core);
                drop_queue.flush(&mut ());
            }
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((sock, peer, local)) => {
                    let id = next_id;
                    next_id += 1;
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    core.conns.insert(id, cmd_tx);
                    let conn = Connection::new(&shared.config, peer, local);
                    match sock {
                        Accepted::Tcp(s) => {
                            tokio::task::spawn_local(connection_task(id, s, conn, cmd_rx, shared.clone()));
                        }
                        #[cfg(unix)]
                        Accepted::Unix(s) => {
                            tokio::task::spawn_local(connection_task(id, s, conn, cmd_rx, shared.clone()));
                        }
                    }
                }
                // Accept failures affect no existing connection.
                Err(err) => warn!(%err, "accept failed"),
            },
        }
    }
}

async fn connection_task<S>(
    id: ConnId,
    sock: S,
    mut conn: Connection,
    mut cmd_rx: UnboundedReceiver<ConnCmd>,
    shared: Rc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(sock);
    let mut read_buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
    let mut events: Vec<ConnEvent> = Vec::new();
    let mut ws_open_announced = false;

    'run: loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Respond(response)) => {
                    if conn.is_upgraded() || conn.response_scheduled() {
                        // The response targets a connection that already
                        // switched protocols or was already answered; hand
                        // it back to the main thread for disposal, since
                        // its data source may carry main-owned state.
                        defer_drop(Role::Main, response);
                        continue;
                    }
                    match write_response(&mut conn, &mut wr, response).await {
                        Ok(false) => conn.request_finished(),
                        Ok(true) => break 'run,
                        Err(err) => {
                            debug!(conn = id, %err, "response write failed");
                            break 'run;
                        }
                    }
                }
                Some(ConnCmd::WsSend { binary, data }) => {
                    let Some(session) = conn.session_mut() else { continue };
                    let mut out = BytesMut::new();
                    match session.encode_message(binary, &data, &mut out) {
                        Ok(()) => {
                            if let Err(err) = write_all_flush(&mut wr, &out).await {
                                debug!(conn = id, %err, "frame write failed");
                                break 'run;
                            }
                        }
                        Err(err) => debug!(conn = id, %err, "dropping unsendable message"),
                    }
                }
                Some(ConnCmd::Close) | None => break 'run,
            },
            read = rd.read_buf(&mut read_buf) => match read {
                // Clean EOF closes silently.
                Ok(0) => break 'run,
                Ok(_) => {
                    events.clear();
                    if let Err(err) = conn.on_bytes(&mut read_buf, &mut events) {
                        debug!(conn = id, %err, "closing connection");
                        break 'run;
                    }
                    for event in events.drain(..) {
                        match handle_event(id, event, &mut wr, &shared, &mut ws_open_announced).await {
                            Ok(true) => {}
                            Ok(false) => break 'run,
                            Err(err) => {
                                debug!(conn = id, %err, "closing connection");
                                break 'run;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(conn = id, %err, "read error");
                    break 'run;
                }
            },
        }
    }

    // Close ordering: WebSocket close callback, deregistration from the
    // connection registry, socket closure. The connection itself is
    // destroyed on the background thread when this task ends.
    if let Some(session) = conn.session_mut() {
        if session.mark_closed() && ws_open_announced {
            let handle = WsHandle {
                id,
                engine: shared.engine_queue.clone(),
            };
            shared.main_queue.push(move |ctx| ctx.handler.on_ws_close(handle));
        }
    }
    shared.engine_queue.push(move |core| core.deregister(id));
    let mut sock = rd.unsplit(wr);
    let _ = sock.shutdown().await;
}

/// Handle one state-machine event. Returns `Ok(false)` to close the
/// connection.
async fn handle_event<W>(
    id: ConnId,
    event: ConnEvent,
    wr: &mut W,
    shared: &Rc<Shared>,
    ws_open_announced: &mut bool,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match event {
        ConnEvent::Dispatch(request) => {
            let engine = shared.engine_queue.clone();
            shared.main_queue.push(move |ctx| {
                let response = ctx.handler.on_request(request);
                engine.push(move |core| core.command(id, ConnCmd::Respond(response)));
            });
            Ok(true)
        }
        ConnEvent::UpgradeAccepted { head, body } => {
            write_all_flush(wr, &head).await?;
            if !body.is_empty() {
                write_all_flush(wr, &body).await?;
            }
            *ws_open_announced = true;
            let handle = WsHandle {
                id,
                engine: shared.engine_queue.clone(),
            };
            shared.main_queue.push(move |ctx| ctx.handler.on_ws_open(handle));
            Ok(true)
        }
        ConnEvent::WsMessage { binary, data } => {
            let handle = WsHandle {
                id,
                engine: shared.engine_queue.clone(),
            };
            shared
                .main_queue
                .push(move |ctx| ctx.handler.on_ws_message(handle, binary, data));
            Ok(true)
        }
        // Pings and pongs arrive but are intentionally not auto-answered.
        ConnEvent::WsPing(_) | ConnEvent::WsPong(_) => Ok(true),
        // Close the socket without echoing a close frame.
        ConnEvent::WsCloseRequested => Ok(false),
    }
}

/// Serialize and stream one response. Returns whether the connection
/// should close afterwards.
async fn write_response<W>(conn: &mut Connection, wr: &mut W, mut response: Response) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    conn.set_response_scheduled();
    if conn.peer_wants_close() {
        response = response.close_after_write(true);
    }

    let mut head = BytesMut::with_capacity(256);
    response.encode_head(&mut head);
    write_all_flush(wr, &head).await?;

    let close = response.wants_close();
    if let Some(mut body) = response.take_body() {
        writer::write_source(wr, body.as_mut()).await?;
    }
    // The response is dropped here, right after its write completes.
    Ok(close)
}

async fn write_all_flush<W>(wr: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(data).await?;
    wr.flush().await?;
    Ok(())
}
