use search_ranking_router::init_logging;

#[test]
fn test_init_logging_installs_subscriber() {
    init_logging(true, false);

    tracing::info!("Subscriber installed");
    assert!(tracing::dispatcher::has_been_set());
}
