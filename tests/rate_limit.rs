//! The export worker caps the number of records sent per one-second
//! window when an fps limit is configured.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowprobe::export::{ExportStats, FlowExporter};
use flowprobe::flow::Flow;
use flowprobe::packet::PacketRecord;
use flowprobe::ring::{ExportItem, FlowRing};
use flowprobe::worker::{ShutdownHandle, export_worker};

struct CountingExporter {
    times: Arc<Mutex<Vec<Instant>>>,
}

impl FlowExporter for CountingExporter {
    fn export_flow(&mut self, _flow: &Flow) {
        self.times.lock().unwrap().push(Instant::now());
    }
    fn export_packet(&mut self, _pkt: &PacketRecord) {}
    fn flush(&mut self) {}
    fn shutdown(&mut self) {}
    fn stats(&self) -> ExportStats {
        ExportStats::default()
    }
}

#[test]
fn fps_limits_flows_per_second() {
    let ring = Arc::new(FlowRing::new(64));
    for _ in 0..20 {
        assert!(ring.push(ExportItem::Flow(Box::default())));
    }

    let times = Arc::new(Mutex::new(Vec::new()));
    let exporter = Box::new(CountingExporter {
        times: times.clone(),
    });

    let shutdown = ShutdownHandle::new();
    let handle = {
        let ring = ring.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || export_worker(exporter, ring, 10, shutdown))
    };

    // Let the worker drain the queue at 10 flows/s, then stop it.
    while !ring.is_empty() {
        std::thread::sleep(Duration::from_millis(50));
    }
    shutdown.terminate_export.store(true, Ordering::SeqCst);
    let stats = handle.join().unwrap();
    assert_eq!(stats.biflows, 20);

    let times = times.lock().unwrap();
    assert_eq!(times.len(), 20);

    // No one-second window may carry more than the cap; allow a little
    // scheduling slack.
    for (i, start) in times.iter().enumerate() {
        let within = times[i..]
            .iter()
            .take_while(|t| t.duration_since(*start) < Duration::from_secs(1))
            .count();
        assert!(within <= 12, "{} flows within one second", within);
    }

    // Twenty flows at 10/s cannot finish faster than about a second.
    let span = times.last().unwrap().duration_since(times[0]);
    assert!(span >= Duration::from_millis(900), "drained in {:?}", span);
}
