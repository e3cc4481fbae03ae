//! Stack runtime: link readers, the dispatcher executor and the writer.
//!
//! Each link gets a reader thread that blocks on its transport with a
//! short timeout, reassembles frames and pushes whole packets into the
//! inbound channel. One dispatcher thread owns the engine and the ports
//! and runs an `edge-executor` with three tasks:
//!
//! 1. **Dispatch**: wakes on `inbound.receive().await`
//! 2. **Tick**: `async-io-mini` timer every `tick_interval_ms`
//! 3. **Write**: wakes on `outbound.receive().await`
//!
//! ```text
//!  ┌─────────────┐        ┌──────────────────────────────────────────┐
//!  │ 485 reader  │──┐     │  Dispatcher thread                       │
//!  ├─────────────┤  │     │  ┌────────────────────────────────────┐  │
//!  │ tcp reader  │──┼────▶│  │ edge_executor::LocalExecutor       │  │
//!  ├─────────────┤  │     │  │  ┌──────────┐ ┌──────┐ ┌────────┐  │  │
//!  │ subctl rdr  │──┘     │  │  │ Dispatch │ │ Tick │ │ Write  │──┼──┼──▶ links
//!  └─────────────┘        │  │  └──────────┘ └──────┘ └────────┘  │  │
//!   StackHandle::report ─▶│  └────────────────────────────────────┘  │
//!   StackHandle::http   ─▶└──────────────────────────────────────────┘
//! ```

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, info, warn};

use super::channels::{HttpReply, InboundMsg, StackChannels};
use super::engine::{self, LinkDecoder, ProtocolEngine};
use super::http;
use super::router::DataSource;
use super::sync::SyncBridge;
use super::transport::{Transport, TransportError, TransportId};
use crate::adapters::time::MonotonicClock;
use crate::app::ports::PortSet;
use crate::config::StackConfig;
use crate::error::{Error, SyncError};

const READ_BUF_SIZE: usize = 1024;

/// How long a reader blocks before checking for shutdown and expiry.
const READ_POLL: Duration = Duration::from_millis(50);

/// Wait for the dispatcher to answer an HTTP body.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

type StopSignal = Signal<CriticalSectionRawMutex, ()>;
type Writers = [Option<Box<dyn Transport + Send>>; 4];

/// A duplex link: the reader runs on its own thread, the writer is owned
/// by the dispatcher. Serial ports and sockets provide both halves via
/// `try_clone`.
pub struct Link {
    pub id: TransportId,
    pub reader: Box<dyn Transport + Send>,
    pub writer: Box<dyn Transport + Send>,
}

impl Link {
    pub fn new(
        id: TransportId,
        reader: impl Transport + Send + 'static,
        writer: impl Transport + Send + 'static,
    ) -> Self {
        Self {
            id,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

// ── Reader threads ───────────────────────────────────────────

fn read_loop(
    id: TransportId,
    mut reader: Box<dyn Transport + Send>,
    mut decoder: LinkDecoder,
    clock: MonotonicClock,
    channels: &StackChannels,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut buf, READ_POLL) {
            Ok(0) => decoder.expire(id, clock.now_ms()),
            Ok(n) => {
                for packet in decoder.feed(id, &buf[..n], clock.now_ms()) {
                    channels.push_inbound(InboundMsg::Packet { source: id, packet });
                }
            }
            Err(TransportError::Disconnected) => {
                info!("IO[{}]: peer gone, reader stopping", id);
                channels.push_inbound(InboundMsg::LinkDown { source: id });
                return;
            }
            Err(TransportError::Io) => {
                warn!("IO[{}]: read error", id);
                std::thread::sleep(READ_POLL);
            }
        }
    }
    debug!("IO[{}]: reader stopped", id);
}

// ── Dispatcher tasks ─────────────────────────────────────────

type SharedEngine = Rc<RefCell<ProtocolEngine>>;
type SharedPorts = Rc<RefCell<PortSet>>;
type SharedWriters = Rc<RefCell<Writers>>;

async fn dispatch_loop(
    engine: SharedEngine,
    ports: SharedPorts,
    writers: SharedWriters,
    channels: Arc<StackChannels>,
    clock: MonotonicClock,
) {
    loop {
        let msg = channels.inbound.receive().await;
        let now = clock.now_ms();
        let out = {
            let mut engine = engine.borrow_mut();
            let mut set = ports.borrow_mut();
            let mut p = PortSet::borrow(&mut set);
            match msg {
                InboundMsg::Packet { source, packet } => {
                    engine.receive_packet(source, &packet, now, &mut p)
                }
                InboundMsg::Report { source, data } => engine.report(source, &data, now, &mut p),
                InboundMsg::Http { body, reply } => {
                    match http::handle_body(&mut engine, &body, now, &mut p) {
                        Ok((answer, out)) => {
                            reply.signal(Ok(answer));
                            out
                        }
                        Err(e) => {
                            warn!("IO[http]: {}", e);
                            reply.signal(Err(e));
                            Vec::new()
                        }
                    }
                }
                InboundMsg::LinkDown { source } => {
                    engine.reset_link(source);
                    writers.borrow_mut()[source.index()] = None;
                    Vec::new()
                }
            }
        };
        for o in out {
            channels.push_outbound(o);
        }
    }
}

async fn tick_loop(
    engine: SharedEngine,
    ports: SharedPorts,
    channels: Arc<StackChannels>,
    clock: MonotonicClock,
    interval: Duration,
) {
    loop {
        async_io_mini::Timer::after(interval).await;
        let out = {
            let mut set = ports.borrow_mut();
            let mut p = PortSet::borrow(&mut set);
            engine.borrow_mut().tick(clock.now_ms(), &mut p)
        };
        for o in out {
            channels.push_outbound(o);
        }
    }
}

async fn write_loop(writers: SharedWriters, channels: Arc<StackChannels>) {
    loop {
        let out = channels.outbound.receive().await;
        let mut w = writers.borrow_mut();
        let slot = &mut w[out.dest.index()];
        let Some(link) = slot.as_mut() else {
            debug!("IO[{}]: no link, dropping {} bytes", out.dest, out.bytes.len());
            continue;
        };
        if let Err(e) = link.write_all(&out.bytes).and_then(|()| link.flush()) {
            warn!("IO[{}]: write failed: {}", out.dest, e);
            if e == TransportError::Disconnected {
                *slot = None;
            }
        }
    }
}

fn run_dispatcher(
    engine: ProtocolEngine,
    ports: PortSet,
    writers: Writers,
    channels: Arc<StackChannels>,
    clock: MonotonicClock,
    tick: Duration,
    stop: Arc<StopSignal>,
) {
    let executor: edge_executor::LocalExecutor<'_, 8> = edge_executor::LocalExecutor::new();

    let engine: SharedEngine = Rc::new(RefCell::new(engine));
    let ports: SharedPorts = Rc::new(RefCell::new(ports));
    let writers: SharedWriters = Rc::new(RefCell::new(writers));

    executor
        .spawn(dispatch_loop(
            engine.clone(),
            ports.clone(),
            writers.clone(),
            channels.clone(),
            clock,
        ))
        .detach();
    executor
        .spawn(tick_loop(engine, ports, channels.clone(), clock, tick))
        .detach();
    executor.spawn(write_loop(writers, channels)).detach();

    info!("IO: dispatcher started (tick {} ms)", tick.as_millis());
    futures_lite::future::block_on(executor.run(stop.wait()));
    info!("IO: dispatcher stopped");
}

// ── Start / handle ───────────────────────────────────────────

/// Running stack. Dropping the handle leaves the threads running; call
/// [`StackHandle::shutdown`] to stop them.
pub struct StackHandle {
    channels: Arc<StackChannels>,
    stop_readers: Arc<AtomicBool>,
    stop_dispatcher: Arc<StopSignal>,
    dispatcher: JoinHandle<()>,
    readers: Vec<JoinHandle<()>>,
}

/// Spawn reader threads for every link and the dispatcher thread.
pub fn start(
    config: StackConfig,
    bridge: Arc<SyncBridge>,
    ports: PortSet,
    links: Vec<Link>,
) -> std::io::Result<StackHandle> {
    let channels = Arc::new(StackChannels::new());
    let stop_readers = Arc::new(AtomicBool::new(false));
    let stop_dispatcher = Arc::new(StopSignal::new());
    let clock = MonotonicClock::new();

    let mut writers: Writers = Default::default();
    let mut readers = Vec::with_capacity(links.len());
    for link in links {
        let decoder = LinkDecoder::new(
            engine::expects_result(&config.transports, link.id),
            config.partial_frame_expiry_ms,
        );
        writers[link.id.index()] = Some(link.writer);
        let (id, reader) = (link.id, link.reader);
        let ch = channels.clone();
        let stop = stop_readers.clone();
        readers.push(
            std::thread::Builder::new()
                .name(format!("vg-read-{}", id))
                .spawn(move || read_loop(id, reader, decoder, clock, &ch, &stop))?,
        );
        info!("IO[{}]: link up", id);
    }

    let tick = Duration::from_millis(config.tick_interval_ms);
    let engine = ProtocolEngine::new(config, bridge);
    let ch = channels.clone();
    let stop = stop_dispatcher.clone();
    let dispatcher = std::thread::Builder::new()
        .name("vg-dispatch".into())
        .spawn(move || run_dispatcher(engine, ports, writers, ch, clock, tick, stop))?;

    Ok(StackHandle {
        channels,
        stop_readers,
        stop_dispatcher,
        dispatcher,
        readers,
    })
}

impl StackHandle {
    /// Route business data (scan, card, password) through the stack.
    pub fn report(&self, source: DataSource, data: &[u8]) -> bool {
        self.channels.push_inbound(InboundMsg::Report {
            source,
            data: data.to_vec(),
        })
    }

    /// Run an HTTP request body and wait for the JSON reply body.
    pub fn http(&self, body: &[u8], timeout: Duration) -> Result<Option<String>, Error> {
        let reply: Arc<HttpReply> = Arc::new(Signal::new());
        let queued = self.channels.push_inbound(InboundMsg::Http {
            body: body.to_vec(),
            reply: reply.clone(),
        });
        if !queued {
            return Err(Error::Sync(SyncError::Busy));
        }
        futures_lite::future::block_on(futures_lite::future::or(reply.wait(), async {
            async_io_mini::Timer::after(timeout).await;
            Err(Error::Sync(SyncError::Timeout))
        }))
    }

    pub fn channels(&self) -> &Arc<StackChannels> {
        &self.channels
    }

    /// Block until the dispatcher exits.
    pub fn join(self) {
        let _ = self.dispatcher.join();
    }

    /// Stop every thread and wait for them.
    pub fn shutdown(self) {
        self.stop_readers.store(true, Ordering::Relaxed);
        self.stop_dispatcher.signal(());
        for r in self.readers {
            let _ = r.join();
        }
        let _ = self.dispatcher.join();
    }
}
