//! Capture-to-sink runtime.
//!
//! The capture loop is the single producer: [`Runtime::deliver`] decodes each
//! frame and hands it to one of N workers selected by flow-key hash, so all
//! packets of a flow are processed by the same worker in capture order while
//! distinct flows proceed in parallel. Workers share nothing but the
//! read-only registry and the publisher channel.

use crate::config::Config;
use crate::conntrack::pdu::L4Pdu;
use crate::conntrack::ConnTracker;
use crate::protocols::packet::{decode_frame, LinkType};
use crate::protocols::stream::ParserRegistry;
use crate::publish::{spawn_publisher, Publisher, Sink};
use crate::stats::STATS;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Sender;

enum WorkerMsg {
    Packet(L4Pdu),
    /// Wall-clock idle tick; advances the worker's virtual clock by one
    /// sweep interval so idle flows expire during capture lulls.
    Tick,
    Shutdown,
}

pub struct Runtime {
    config: Config,
    worker_txs: Vec<Sender<WorkerMsg>>,
    workers: Vec<JoinHandle<()>>,
    publisher_handle: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    ticker_stop: Arc<AtomicBool>,
}

impl Runtime {
    /// Builds the registry, publisher and worker pool. The configuration is
    /// validated first; a bad config refuses to start.
    pub fn new(config: Config, sink: Box<dyn Sink>) -> Result<Runtime> {
        config.validate()?;
        let registry = Arc::new(ParserRegistry::new(&config)?);

        let (pub_tx, pub_rx) = crossbeam_channel::bounded(config.runtime.publish_queue);
        let publisher_handle = spawn_publisher(pub_rx, sink);
        let publisher = Publisher::new(pub_tx, config.runtime.sampling);

        let mut worker_txs = Vec::with_capacity(config.runtime.workers);
        let mut workers = Vec::with_capacity(config.runtime.workers);
        for i in 0..config.runtime.workers {
            let (tx, rx) = crossbeam_channel::bounded::<WorkerMsg>(config.runtime.queue_size);
            let registry = Arc::clone(&registry);
            let publisher = publisher.clone();
            let runtime_cfg = config.runtime.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || {
                    let mut tracker = ConnTracker::new(registry, &runtime_cfg);
                    let mut latest_ts: u64 = 0;
                    for msg in rx.iter() {
                        match msg {
                            WorkerMsg::Packet(pdu) => {
                                latest_ts = latest_ts.max(pdu.ctxt.ts);
                                tracker.process(pdu, &publisher);
                            }
                            WorkerMsg::Tick => {
                                latest_ts += runtime_cfg.sweep_interval;
                                tracker.sweep(latest_ts, &publisher);
                            }
                            WorkerMsg::Shutdown => break,
                        }
                    }
                    tracker.drain(latest_ts, &publisher);
                })
                .expect("failed to spawn worker thread");
            worker_txs.push(tx);
            workers.push(handle);
        }

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = if config.runtime.tick {
            let txs = worker_txs.clone();
            let stop = Arc::clone(&ticker_stop);
            let interval = Duration::from_millis(config.runtime.sweep_interval);
            Some(
                thread::Builder::new()
                    .name("ticker".into())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            thread::sleep(interval);
                            for tx in &txs {
                                // a congested worker will sweep on its own
                                let _ = tx.try_send(WorkerMsg::Tick);
                            }
                        }
                    })
                    .expect("failed to spawn ticker thread"),
            )
        } else {
            None
        };

        Ok(Runtime {
            config,
            worker_txs,
            workers,
            publisher_handle: Some(publisher_handle),
            ticker,
            ticker_stop,
        })
    }

    /// Capture entry point: decode one frame and dispatch it to the worker
    /// owning its flow.
    pub fn deliver(&self, ts_ms: u64, link: LinkType, frame: &[u8]) {
        STATS.pkts_received.inc();
        let pdu = match decode_frame(link, ts_ms, frame) {
            Ok(pdu) => pdu,
            Err(e) => {
                STATS.pkts_dropped_decode.inc();
                log::trace!("decode drop: {}", e);
                return;
            }
        };

        let conn_id = crate::conntrack::conn_id::ConnId::new(
            pdu.ctxt.src,
            pdu.ctxt.dst,
            pdu.ctxt.proto,
        );
        let mut hasher = DefaultHasher::new();
        conn_id.hash(&mut hasher);
        let idx = (hasher.finish() % self.worker_txs.len() as u64) as usize;
        // blocking send applies backpressure to the capture loop
        let _ = self.worker_txs[idx].send(WorkerMsg::Packet(pdu));
    }

    /// Graceful shutdown: stop ticking, let workers drain their queues and
    /// fin all live flows, then drain the publisher. Bounded by the
    /// configured shutdown timeout; whatever has not flushed by then is
    /// abandoned and counted.
    pub fn shutdown(mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }

        for tx in &self.worker_txs {
            let _ = tx.send(WorkerMsg::Shutdown);
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.runtime.shutdown_timeout);

        let mut workers = std::mem::take(&mut self.workers);
        while !workers.is_empty() && Instant::now() < deadline {
            workers.retain(|handle| !handle.is_finished());
            if !workers.is_empty() {
                thread::sleep(Duration::from_millis(10));
            }
        }
        self.worker_txs.clear();
        if workers.is_empty() {
            // all worker-held senders are gone; the publisher loop ends once
            // its queue is drained
            if let Some(handle) = self.publisher_handle.take() {
                let _ = handle.join();
            }
        } else {
            log::warn!("{} workers did not drain before the deadline", workers.len());
            STATS.events_dropped.add(workers.len() as u64);
        }
    }
}
