use tracing::trace;

// Lightweight trace-based counters; the Prometheus recorder in main picks up
// request-level series, these cover per-route and per-vendor increments.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "marketsync.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn sync_elapsed(vendor: &'static str, elapsed_ms: u128) {
    trace!(
        target = "marketsync.metrics",
        vendor = vendor,
        elapsed_ms = elapsed_ms as u64,
        "sync_elapsed"
    );
}
