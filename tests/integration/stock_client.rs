//! Alpha Vantage client against a mock server

use assert_matches::assert_matches;
use chrono::Duration as ChronoDuration;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::query_param;
use wiremock::{MockServer, ResponseTemplate};

use portfolio_pulse::api::PriceProvider;
use portfolio_pulse::models::{DataFetchMode, Provider};
use portfolio_pulse::PriceError;

use crate::common::api_mock::{self, json_response};
use crate::common::{logging, t0, test_config, TestServices};

#[tokio::test]
async fn test_cached_stock_lookup_skips_network_and_costs_nothing() {
    logging::init_test_logging();
    logging::log_test_step("Fetch SPY, then read it back from cache an hour later");

    let server = MockServer::start().await;
    api_mock::global_quote_for("SPY")
        .respond_with(json_response(api_mock::global_quote_body("SPY", 512.34)))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let stocks = &ctx.services.stocks;

    let first = stocks.get_price("SPY", true).await;
    assert!(first.success);
    assert!(!first.from_cache);
    assert_eq!(first.price, Some(512.34));

    ctx.clock.advance(ChronoDuration::hours(1));
    let second = stocks.get_price("SPY", true).await;
    assert!(second.success);
    assert!(second.from_cache);
    assert_eq!(second.price, Some(512.34));

    let calls = ctx.services.ledger.all_calls().await;
    logging::log_test_data("Ledger", &calls);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].cost, 1);
    assert!(!calls[0].from_cache);
    assert_eq!(calls[1].cost, 0);
    assert!(calls[1].from_cache);
    assert_eq!(calls[1].key.as_deref(), Some("SPY"));
    assert_eq!(calls[1].timestamp, t0() + ChronoDuration::hours(1));
}

#[tokio::test]
async fn test_stock_cache_expires_at_end_of_day() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::global_quote_for("SPY")
        .respond_with(json_response(api_mock::global_quote_body("SPY", 500.0)))
        .expect(2)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    ctx.services.stocks.get_price("SPY", true).await;

    // 10:00 + 14h = 00:00 next day
    ctx.clock.advance(ChronoDuration::hours(14));
    let next_day = ctx.services.stocks.get_price("SPY", true).await;
    assert!(!next_day.from_cache);
}

#[tokio::test]
async fn test_provider_error_without_cache_is_a_failed_result() {
    logging::init_test_logging();
    logging::log_test_step("Error Message for an unknown symbol");

    let server = MockServer::start().await;
    api_mock::global_quote_for("XYZ")
        .respond_with(json_response(api_mock::error_message_body()))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.stocks.get_price("XYZ", true).await;

    assert!(!result.success);
    assert!(!result.from_cache);
    assert_eq!(result.price, None);
    assert!(result.error.unwrap().starts_with("API Error: Invalid API call"));

    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].success);
    assert!(!calls[0].from_cache);
    assert_eq!(calls[0].cost, 1);
    assert_eq!(calls[0].provider, Provider::AlphaVantage);
}

#[tokio::test]
async fn test_rate_limit_note_is_reported_as_throttling() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::global_quote_for("SPY")
        .respond_with(json_response(api_mock::rate_limit_note_body()))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.stocks.get_price("SPY", true).await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("API call frequency limit reached. Please try again later.")
    );
}

#[tokio::test]
async fn test_empty_global_quote_means_no_data() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::global_quote_for("ZZZZ")
        .respond_with(json_response(serde_json::json!({ "Global Quote": {} })))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.stocks.get_price("ZZZZ", true).await;

    assert_eq!(result.error.as_deref(), Some("No price data found for ZZZZ"));
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_stale_cache() {
    logging::init_test_logging();
    logging::log_test_step("Cached SPY from yesterday, provider now failing");

    let server = MockServer::start().await;
    api_mock::global_quote_for("SPY")
        .respond_with(json_response(api_mock::global_quote_body("SPY", 498.5)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    api_mock::global_quote_for("SPY")
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    ctx.services.stocks.get_price("SPY", true).await;

    ctx.clock.advance(ChronoDuration::days(1));
    let result = ctx.services.stocks.get_price("SPY", true).await;

    assert!(!result.success);
    assert!(result.from_cache);
    assert_eq!(result.price, Some(498.5));
    let error = result.error.unwrap();
    assert!(error.starts_with("API error: HTTP 503"), "unexpected error: {}", error);
    assert!(error.ends_with("(showing cached data)"));

    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 2);
    assert!(!calls[1].success);
    assert!(!calls[1].from_cache);
}

#[tokio::test]
async fn test_forced_refresh_bypasses_valid_cache() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::global_quote_for("SPY")
        .respond_with(json_response(api_mock::global_quote_body("SPY", 500.0)))
        .expect(2)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    ctx.services.stocks.get_price("SPY", true).await;
    let forced = ctx.services.stocks.get_price("SPY", false).await;

    assert!(forced.success);
    assert!(!forced.from_cache);
}

#[tokio::test]
async fn test_back_to_back_lookups_respect_rate_limit() {
    logging::init_test_logging();
    logging::log_test_step("Two symbols issued concurrently share one limiter");

    let server = MockServer::start().await;
    for (symbol, price) in [("SPY", 500.0), ("VTI", 250.0)] {
        api_mock::global_quote_for(symbol)
            .respond_with(json_response(api_mock::global_quote_body(symbol, price)))
            .mount(&server)
            .await;
    }

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let stocks = Arc::clone(&ctx.services.stocks);
    let spacing = stocks.rate_limiter().min_interval();
    assert_eq!(spacing, Duration::from_millis(300));

    let started = Instant::now();
    let (a, b) = tokio::join!(stocks.get_price("SPY", true), stocks.get_price("VTI", true));
    let elapsed = started.elapsed();

    assert!(a.success && b.success);
    assert!(elapsed >= spacing, "second fetch started after only {:?}", elapsed);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_multiple_prices_are_sequential_and_ordered() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    for (symbol, price) in [("SPY", 500.0), ("VTI", 250.0), ("QQQ", 430.0)] {
        api_mock::global_quote_for(symbol)
            .respond_with(json_response(api_mock::global_quote_body(symbol, price)))
            .expect(1)
            .mount(&server)
            .await;
    }

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let symbols = ctx.services.config.distinct_stock_symbols();

    let started = Instant::now();
    let results = ctx.services.stocks.get_multiple_prices(&symbols, true).await;
    assert!(started.elapsed() >= Duration::from_millis(600));

    let keys: Vec<&str> = results.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["SPY", "VTI", "QQQ"]);
    assert!(results.iter().all(|r| r.success && !r.from_cache));

    // Everything is cached now
    let again = ctx.services.stocks.get_multiple_prices(&symbols, true).await;
    assert!(again.iter().all(|r| r.from_cache));
    assert_eq!(ctx.services.ledger.all_calls().await.len(), 6);
}

#[tokio::test]
async fn test_cached_prices_only_never_touches_network_or_ledger() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::global_quote_for("SPY")
        .respond_with(json_response(api_mock::global_quote_body("SPY", 500.0)))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    ctx.services.stocks.get_price("SPY", true).await;
    let recorded = ctx.services.ledger.all_calls().await.len();

    let symbols = vec!["SPY".to_string(), "VTI".to_string()];
    let first = ctx.services.stocks.get_cached_prices_only(&symbols).await;
    let second = ctx.services.stocks.get_cached_prices_only(&symbols).await;

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].key, "SPY");
    assert!(first[0].from_cache);
    assert_eq!(ctx.services.ledger.all_calls().await.len(), recorded);
}

#[tokio::test]
async fn test_cache_status_and_clear() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    for symbol in ["SPY", "VTI"] {
        api_mock::global_quote_for(symbol)
            .respond_with(json_response(api_mock::global_quote_body(symbol, 100.0)))
            .mount(&server)
            .await;
    }

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let stocks = &ctx.services.stocks;
    stocks.get_price("SPY", true).await;
    stocks.get_price("VTI", true).await;

    let status = stocks.cache_status().await;
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|s| s.is_valid && s.cached_at == t0()));

    stocks.clear_cache(Some("SPY")).await;
    let status = stocks.cache_status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].key, "VTI");

    stocks.clear_cache(None).await;
    assert!(stocks.cache_status().await.is_empty());
}

#[tokio::test]
async fn test_connection_reports_probe_price() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::global_quote_for("AAPL")
        .respond_with(json_response(api_mock::global_quote_body("AAPL", 227.5)))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.stocks.test_connection().await;

    assert!(result.success);
    assert_eq!(result.message, "Alpha Vantage API working. AAPL price: $227.50");
    assert_eq!(ctx.services.ledger.all_calls().await.len(), 1);
}

#[tokio::test]
async fn test_daily_history_is_sorted_and_recorded() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path(api_mock::QUOTE_PATH))
        .and(query_param("function", "TIME_SERIES_DAILY"))
        .and(query_param("symbol", "SPY"))
        .and(query_param("outputsize", "compact"))
        .respond_with(json_response(serde_json::json!({
            "Meta Data": { "2. Symbol": "SPY" },
            "Time Series (Daily)": {
                "2025-03-07": { "1. open": "505.0", "2. high": "512.0", "3. low": "503.0", "4. close": "510.0", "5. volume": "1000" },
                "2025-03-06": { "1. open": "500.0", "2. high": "506.0", "3. low": "498.0", "4. close": "504.0", "5. volume": "2000" }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let bars = ctx
        .services
        .stocks
        .get_daily_history("SPY", DataFetchMode::Compact)
        .await
        .unwrap();

    assert_eq!(bars.len(), 2);
    assert_eq!(bars[0].close, 504.0);
    assert_eq!(bars[1].volume, 1000);

    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].endpoint, "TIME_SERIES_DAILY");
    assert!(calls[0].success);
}

#[tokio::test]
async fn test_daily_history_surfaces_provider_errors() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::path(api_mock::QUOTE_PATH))
        .and(query_param("function", "TIME_SERIES_DAILY"))
        .respond_with(json_response(api_mock::rate_limit_note_body()))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.stocks.get_daily_history("SPY", DataFetchMode::Full).await;

    assert_matches!(result, Err(PriceError::RateLimited(_)));
    assert!(!ctx.services.ledger.all_calls().await[0].success);
}
