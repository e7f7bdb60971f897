use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::disposable::Disposable;
use crate::event_loop::LoopContext;
use crate::transport::frame::FrameDecoder;
use crate::transport::{PackageHandler, Transport};


/// Length-prefixed frames over a TCP connection.
///
/// Reading and writing run in two loop tasks. Inbound frames are handed to the bound handler as
///  soon as they are complete, so [Transport::update] has nothing to do. Any read or write
///  failure, and any malformed frame, is fatal: the transport disposes itself gracefully, which
///  notifies the handler.
pub struct StreamTransport {
    peer_addr: SocketAddr,
    myself: Weak<StreamTransport>,
    decoder: RefCell<FrameDecoder>,
    handler: RefCell<Option<Weak<dyn PackageHandler>>>,
    send_queue: RefCell<Option<mpsc::UnboundedSender<Bytes>>>,
    read_task: RefCell<Option<JoinHandle<()>>>,
    disposed: Cell<bool>,
}

impl StreamTransport {
    pub fn new(ctx: &Rc<LoopContext>, stream: TcpStream) -> anyhow::Result<Rc<StreamTransport>> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (send_queue, send_rx) = mpsc::unbounded_channel();

        let transport = Rc::new_cyclic(|myself| StreamTransport {
            peer_addr,
            myself: myself.clone(),
            decoder: RefCell::new(FrameDecoder::new(ctx.config().max_frame_len)),
            handler: RefCell::new(None),
            send_queue: RefCell::new(Some(send_queue)),
            read_task: RefCell::new(None),
            disposed: Cell::new(false),
        });

        let read_task = tokio::task::spawn_local(Self::read_loop(transport.myself.clone(), reader, ctx.config().recv_buf_len));
        *transport.read_task.borrow_mut() = Some(read_task);
        tokio::task::spawn_local(Self::write_loop(transport.myself.clone(), writer, send_rx));

        debug!("TCP connection to {:?} established", peer_addr);
        Ok(transport)
    }

    async fn read_loop(myself: Weak<StreamTransport>, mut reader: OwnedReadHalf, recv_buf_len: usize) {
        let mut buf = vec![0u8; recv_buf_len];
        loop {
            let result = reader.read(&mut buf).await;

            let Some(transport) = myself.upgrade() else { return; };
            match result {
                Ok(0) => {
                    debug!("TCP connection to {:?} closed by peer", transport.peer_addr);
                    transport.dispose(true);
                    return;
                }
                Ok(n) => {
                    trace!("received {} bytes from {:?}", n, transport.peer_addr);
                    if let Err(e) = transport.on_received(&buf[..n]) {
                        warn!("closing TCP connection to {:?}: {}", transport.peer_addr, e);
                        transport.dispose(true);
                        return;
                    }
                    if transport.disposed.get() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("error reading from {:?}: {}", transport.peer_addr, e);
                    transport.dispose(true);
                    return;
                }
            }
        }
    }

    async fn write_loop(myself: Weak<StreamTransport>, mut writer: OwnedWriteHalf, mut send_rx: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(frame) = send_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                if let Some(transport) = myself.upgrade() {
                    warn!("error writing to {:?}, closing connection: {}", transport.peer_addr, e);
                    transport.dispose(true);
                }
                return;
            }
        }
        // all senders are gone, i.e. the transport was disposed: flush is done, so close gracefully
        let _ = writer.shutdown().await;
    }

    fn on_received(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut frames = Vec::new();
        // frames before a bad length prefix are delivered before the connection fails
        let unpacked = self.decoder.borrow_mut()
            .unpack(data, &mut frames);

        if frames.is_empty() {
            return unpacked;
        }
        let Some(handler) = self.handler.borrow().as_ref().and_then(|h| h.upgrade()) else {
            trace!("no handler bound, dropping {} frames", frames.len());
            return unpacked;
        };
        for frame in frames {
            handler.handle_package(frame)?;
            if self.disposed.get() {
                return Ok(());
            }
        }
        unpacked
    }
}

impl Transport for StreamTransport {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn send_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.disposed.get() {
            bail!("connection is closed");
        }
        self.send_queue.borrow()
            .as_ref()
            .ok_or_else(|| anyhow!("connection is closed"))?
            .send(frame)
            .map_err(|_| anyhow!("connection is closed"))
    }

    fn flush(&self) -> anyhow::Result<()> {
        // frames are written as soon as they are queued, and Nagle is off
        Ok(())
    }

    fn update(&self, _now_ms: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_kcp(&self) -> bool {
        false
    }

    fn bind_handler(&self, handler: Weak<dyn PackageHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }
}

impl Disposable for StreamTransport {
    fn disposed(&self) -> bool {
        self.disposed.get()
    }

    fn dispose(&self, graceful: bool) {
        if self.disposed.replace(true) {
            return;
        }
        debug!("disposing TCP connection to {:?}", self.peer_addr);

        // keep ourselves alive while the handler runs, it typically drops its reference to us
        let _myself = self.myself.upgrade();

        if let Some(task) = self.read_task.borrow_mut().take() {
            task.abort();
        }
        self.send_queue.borrow_mut().take();

        let handler = self.handler.borrow_mut().take();
        if graceful {
            if let Some(handler) = handler.and_then(|h| h.upgrade()) {
                handler.on_transport_closed();
            }
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.get_mut().take() {
            task.abort();
        }
    }
}

impl Debug for StreamTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamTransport{{peer:{:?}, disposed:{}}}", self.peer_addr, self.disposed.get())
    }
}
