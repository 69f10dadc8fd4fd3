use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    relay_stored: AtomicU64,
    relay_delivered: AtomicU64,
    push_dispatched: AtomicU64,
    push_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::SeqCst)
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn frames_ingress(&self) -> u64 {
        self.frames_ingress.load(Ordering::SeqCst)
    }

    pub fn frames_egress(&self) -> u64 {
        self.frames_egress.load(Ordering::SeqCst)
    }

    pub fn mark_relay_stored(&self) {
        self.relay_stored.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relay_delivered(&self) {
        self.relay_delivered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_push_dispatched(&self) {
        self.push_dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_push_failed(&self) {
        self.push_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE sealgram_connections_active gauge\nsealgram_connections_active {}\n# TYPE sealgram_frames_ingress counter\nsealgram_frames_ingress {}\n# TYPE sealgram_frames_egress counter\nsealgram_frames_egress {}\n# TYPE sealgram_relay_stored counter\nsealgram_relay_stored {}\n# TYPE sealgram_relay_delivered counter\nsealgram_relay_delivered {}\n# TYPE sealgram_push_dispatched counter\nsealgram_push_dispatched {}\n# TYPE sealgram_push_failed counter\nsealgram_push_failed {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.relay_stored.load(Ordering::SeqCst),
            self.relay_delivered.load(Ordering::SeqCst),
            self.push_dispatched.load(Ordering::SeqCst),
            self.push_failed.load(Ordering::SeqCst)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_exposition_counts() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_ingress();
        metrics.mark_relay_stored();
        metrics.mark_relay_delivered();
        let text = metrics.encode_prometheus();
        assert!(text.contains("sealgram_connections_active 1"));
        assert!(text.contains("sealgram_frames_ingress 1"));
        assert!(text.contains("sealgram_relay_stored 1"));
        assert!(text.contains("sealgram_relay_delivered 1"));
        metrics.decr_connections();
        assert!(
            metrics
                .encode_prometheus()
                .contains("sealgram_connections_active 0")
        );
    }
}
