use tracing::trace;

// Lightweight metrics helpers; the Prometheus recorder installed at startup
// serves `/metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "onboarding.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "onboarding.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn upload_bytes(slot: &str, bytes: usize) {
    trace!(
        target = "onboarding.metrics",
        slot = slot,
        bytes = bytes as u64,
        "upload_bytes"
    );
}
