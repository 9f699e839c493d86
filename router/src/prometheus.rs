use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

pub(crate) fn prometheus_builder(
    addr: SocketAddr,
    port: u16,
    max_candidate_pool: usize,
) -> Result<PrometheusBuilder, BuildError> {
    let mut addr = addr;
    addr.set_port(port);

    // Duration buckets
    let duration_matcher = Matcher::Suffix(String::from("duration"));
    let n_duration_buckets = 35;
    let mut duration_buckets = Vec::with_capacity(n_duration_buckets);
    // Minimum duration in seconds
    let mut value = 0.00001;
    for _ in 0..n_duration_buckets {
        // geometric sequence
        value *= 1.5;
        duration_buckets.push(value);
    }

    // Retrieved candidates buckets
    let retrieved_matcher = Matcher::Full(String::from("sr_candidates_retrieved"));
    let mut retrieved_buckets: Vec<f64> = (0..20)
        .map(|x| 2.0_f64.powi(x))
        .filter(|x| (*x as usize) < max_candidate_pool)
        .collect();
    retrieved_buckets.push(max_candidate_pool as f64);

    // Rerank batch size buckets
    let batch_size_matcher = Matcher::Full(String::from("sr_rerank_batch_size"));
    let batch_size_buckets: Vec<f64> = (0..11).map(|x| 2.0_f64.powi(x)).collect();

    // Prometheus handler
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .set_buckets_for_metric(retrieved_matcher, &retrieved_buckets)?
        .set_buckets_for_metric(batch_size_matcher, &batch_size_buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_builder_accepts_buckets() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        assert!(prometheus_builder(addr, 9000, 200).is_ok());
        assert!(prometheus_builder(addr, 9000, 1).is_ok());
    }
}
