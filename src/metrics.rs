use tracing::trace;

// Counters are emitted as trace events under `metafield.metrics`; the
// Prometheus recorder installed in main only serves the scrape endpoint.

pub fn inc_requests(route: &'static str) {
    trace!(target = "metafield.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "metafield.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn group_matched(cached: bool) {
    trace!(target = "metafield.metrics", cached, "group_matched_inc");
}

pub fn extraction_finished(products: usize, failures: usize, elapsed_ms: u64) {
    trace!(
        target = "metafield.metrics",
        products = products as u64,
        failures = failures as u64,
        elapsed_ms,
        "extraction_finished"
    );
}
