use crate::models::JobStatus;
use tracing::trace;

// Counters go to the installed Prometheus recorder; each also emits a trace event.

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("scrape_requests_total", "route" => route).increment(1);
    trace!(target: "scrape.metrics", route = route, "requests_total_inc");
}

pub fn scrape_attempt(attempt: u32) {
    let retry = if attempt > 0 { "true" } else { "false" };
    ::metrics::counter!("scrape_attempts_total", "retry" => retry).increment(1);
    trace!(
        target: "scrape.metrics",
        attempt = attempt,
        retry = attempt > 0,
        "scrape_attempts_total_inc"
    );
}

pub fn job_terminal(status: JobStatus) {
    ::metrics::counter!("scrape_jobs_finished_total", "status" => status.as_str()).increment(1);
    trace!(
        target: "scrape.metrics",
        status = status.as_str(),
        "scrape_jobs_finished_total_inc"
    );
}

pub fn job_abandoned() {
    ::metrics::counter!("scrape_jobs_abandoned_total").increment(1);
    trace!(target: "scrape.metrics", "scrape_jobs_abandoned_total_inc");
}

pub fn queue_depth(depth: usize) {
    ::metrics::gauge!("scrape_queue_depth").set(depth as f64);
    trace!(target: "scrape.metrics", depth = depth as u64, "scrape_queue_depth");
}

pub fn fallback_job_created() {
    ::metrics::counter!("scrape_fallback_jobs_total").increment(1);
    trace!(target: "scrape.metrics", "scrape_fallback_jobs_total_inc");
}
