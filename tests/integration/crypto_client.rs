//! CoinGecko client against a mock server

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use wiremock::matchers::query_param;
use wiremock::{MockServer, ResponseTemplate};

use portfolio_pulse::api::PriceProvider;
use portfolio_pulse::models::Provider;

use crate::common::api_mock::{self, json_response};
use crate::common::{logging, test_config, TestServices};

#[tokio::test]
async fn test_crypto_cache_expires_after_five_minutes() {
    logging::init_test_logging();
    logging::log_test_step("bitcoin cached at T0, looked up again at T0+6min");

    let server = MockServer::start().await;
    api_mock::simple_price()
        .and(query_param("ids", "bitcoin"))
        .respond_with(json_response(api_mock::simple_price_body(&[("bitcoin", 64250.12)])))
        .expect(2)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let crypto = &ctx.services.crypto;

    let first = crypto.get_price("bitcoin", true).await;
    assert!(first.success);
    assert_eq!(first.price, Some(64250.12));
    assert_eq!(first.last_updated, Utc.timestamp_opt(1_741_600_800, 0).single());

    ctx.clock.advance(ChronoDuration::minutes(4));
    assert!(crypto.get_price("bitcoin", true).await.from_cache);

    ctx.clock.advance(ChronoDuration::minutes(2));
    let expired = crypto.get_price("bitcoin", true).await;
    assert!(expired.success);
    assert!(!expired.from_cache);
}

#[tokio::test]
async fn test_batch_fans_out_one_response_and_records_once() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .and(query_param("ids", "bitcoin,ethereum"))
        .respond_with(json_response(api_mock::simple_price_body(&[
            ("bitcoin", 64000.0),
            ("ethereum", 3100.0),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let ids = ctx.services.config.crypto_ids.clone();
    let results = ctx.services.crypto.get_multiple_prices(&ids, true).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].key, "bitcoin");
    assert_eq!(results[0].price, Some(64000.0));
    assert_eq!(results[1].key, "ethereum");
    assert_eq!(results[1].price, Some(3100.0));

    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].provider, Provider::CoinGecko);
    assert_eq!(calls[0].key, None);
    assert_eq!(calls[0].cost, 1);

    // Second pass is a single cache-hit record for the whole group
    let cached = ctx.services.crypto.get_multiple_prices(&ids, true).await;
    assert!(cached.iter().all(|r| r.from_cache));
    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls[1].from_cache);
    assert_eq!(calls[1].cost, 0);
}

#[tokio::test]
async fn test_only_uncached_ids_are_requested() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .and(query_param("ids", "bitcoin"))
        .respond_with(json_response(api_mock::simple_price_body(&[("bitcoin", 64000.0)])))
        .expect(1)
        .mount(&server)
        .await;
    api_mock::simple_price()
        .and(query_param("ids", "ethereum"))
        .respond_with(json_response(api_mock::simple_price_body(&[("ethereum", 3100.0)])))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    ctx.services.crypto.get_price("bitcoin", true).await;

    let ids = vec!["bitcoin".to_string(), "ethereum".to_string()];
    let results = ctx.services.crypto.get_multiple_prices(&ids, true).await;

    assert!(results[0].from_cache);
    assert!(!results[1].from_cache);

    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].key.as_deref(), Some("bitcoin"));
    assert!(calls[1].from_cache);
    assert_eq!(calls[2].key.as_deref(), Some("ethereum"));
}

#[tokio::test]
async fn test_ids_missing_from_response_fail_individually() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .respond_with(json_response(api_mock::simple_price_body(&[("bitcoin", 64000.0)])))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let ids = vec!["bitcoin".to_string(), "not-a-coin".to_string()];
    let results = ctx.services.crypto.get_multiple_prices(&ids, true).await;

    assert!(results[0].success);
    assert!(!results[1].success);
    assert_eq!(results[1].error.as_deref(), Some("No price data found for not-a-coin"));

    // One grouped record; an unpriced id makes it a failure
    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].key, None);
    assert!(!calls[0].success);
}

#[tokio::test]
async fn test_unknown_coin_is_recorded_as_failed_call() {
    logging::init_test_logging();
    logging::log_test_step("Single lookup for a coin CoinGecko does not know");

    let server = MockServer::start().await;
    api_mock::simple_price()
        .and(query_param("ids", "not-a-coin"))
        .respond_with(json_response(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.crypto.get_price("not-a-coin", true).await;

    assert!(!result.success);
    assert_eq!(result.price, None);
    assert_eq!(result.symbol.as_deref(), Some("NOT-A-COIN"));
    assert_eq!(result.error.as_deref(), Some("No price data found for not-a-coin"));

    let calls = ctx.services.ledger.all_calls().await;
    logging::log_test_data("Ledger", &calls);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].key.as_deref(), Some("not-a-coin"));
    assert!(!calls[0].success);
    assert!(!calls[0].from_cache);
    assert_eq!(calls[0].cost, 1);

    let live = ctx.services.advisor.live_data_indicators().await;
    assert!(!live.contains_key("not-a-coin"));
}

#[tokio::test]
async fn test_crypto_results_carry_display_symbol() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .respond_with(json_response(api_mock::simple_price_body(&[("bitcoin", 64000.0)])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    api_mock::simple_price()
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let crypto = &ctx.services.crypto;

    let fresh = crypto.get_price("bitcoin", true).await;
    assert_eq!(fresh.symbol.as_deref(), Some("BITCOIN"));

    let cached = crypto.get_price("bitcoin", true).await;
    assert!(cached.from_cache);
    assert_eq!(cached.symbol.as_deref(), Some("BITCOIN"));

    // Provider down: stale answer for bitcoin, plain failure for ethereum
    ctx.clock.advance(ChronoDuration::minutes(10));
    let ids = vec!["bitcoin".to_string(), "ethereum".to_string()];
    let results = crypto.get_multiple_prices(&ids, true).await;
    assert_eq!(results[0].symbol.as_deref(), Some("BITCOIN"));
    assert!(results[0].from_cache);
    assert_eq!(results[1].symbol.as_deref(), Some("ETHEREUM"));
    assert!(!results[1].success);
}

#[tokio::test]
async fn test_large_portfolios_are_split_into_batches_of_100() {
    logging::init_test_logging();

    let ids: Vec<String> = (0..150).map(|i| format!("coin-{}", i)).collect();
    let prices: Vec<(&str, f64)> = ids.iter().map(|id| (id.as_str(), 1.0)).collect();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .respond_with(json_response(api_mock::simple_price_body(&prices)))
        .expect(2)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let results = ctx.services.crypto.get_multiple_prices(&ids, true).await;

    assert_eq!(results.len(), 150);
    assert!(results.iter().all(|r| r.success));

    let requests = server.received_requests().await.unwrap();
    let batch_sizes: Vec<usize> = requests
        .iter()
        .map(|req| {
            req.url
                .query_pairs()
                .find(|(k, _)| k == "ids")
                .map(|(_, v)| v.split(',').count())
                .unwrap_or(0)
        })
        .collect();
    assert_eq!(batch_sizes, vec![100, 50]);
    assert_eq!(ctx.services.ledger.all_calls().await.len(), 2);
}

#[tokio::test]
async fn test_failed_batch_serves_stale_prices_and_fails_the_rest() {
    logging::init_test_logging();
    logging::log_test_step("bitcoin cached earlier, CoinGecko now returns 429");

    let server = MockServer::start().await;
    api_mock::simple_price()
        .respond_with(json_response(api_mock::simple_price_body(&[("bitcoin", 60000.0)])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    api_mock::simple_price()
        .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    ctx.services.crypto.get_price("bitcoin", true).await;
    ctx.clock.advance(ChronoDuration::minutes(10));

    let ids = vec!["bitcoin".to_string(), "ethereum".to_string()];
    let results = ctx.services.crypto.get_multiple_prices(&ids, true).await;

    assert!(!results[0].success);
    assert!(results[0].from_cache);
    assert_eq!(results[0].price, Some(60000.0));
    assert!(results[0].error.as_deref().unwrap().contains("showing cached data"));

    assert!(!results[1].success);
    assert!(!results[1].from_cache);
    assert_eq!(results[1].price, None);

    let calls = ctx.services.ledger.all_calls().await;
    assert_eq!(calls.len(), 2);
    assert!(!calls[1].success);
    assert_eq!(calls[1].cost, 1);
}

#[tokio::test]
async fn test_results_are_cached_even_when_cache_is_bypassed() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .respond_with(json_response(api_mock::simple_price_body(&[("bitcoin", 61000.0)])))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    ctx.services.crypto.get_price("bitcoin", false).await;

    let cached = ctx
        .services
        .crypto
        .get_cached_prices_only(&["bitcoin".to_string()])
        .await;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].price, Some(61000.0));
}

#[tokio::test]
async fn test_crypto_connection_probe() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .and(query_param("ids", "bitcoin"))
        .respond_with(json_response(api_mock::simple_price_body(&[("bitcoin", 64250.0)])))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.crypto.test_connection().await;

    assert!(result.success);
    assert_eq!(result.message, "CoinGecko API working. Bitcoin price: $64250.00");
}

#[tokio::test]
async fn test_crypto_connection_probe_failure_message() {
    logging::init_test_logging();

    let server = MockServer::start().await;
    api_mock::simple_price()
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let ctx = TestServices::new(test_config(&server.uri())).await;
    let result = ctx.services.crypto.test_connection().await;

    assert!(!result.success);
    assert_eq!(result.message, "HTTP 500: boom");
}
