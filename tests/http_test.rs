//! End-to-end tests against a live listener: the full worker protocol from
//! `/setup` through submission, restart included.
//!
//! Run with: cargo test --test http_test

use serde_json::{json, Value};
use std::sync::Arc;
use wfcoord::config::{Config, SampleLimits, WorkerProfile};
use wfcoord::http;
use wfcoord::state::Coordinator;

const URL_A: &str = "https://a.test";
const URL_B: &str = "https://b.test";

/// Small bounds so test payloads stay small.
fn test_limits() -> SampleLimits {
    SampleLimits {
        min_pcap: 1024,
        max_pcap: 4096,
        min_png: 1024,
    }
}

fn write_inputs(dir: &std::path::Path) {
    std::fs::write(dir.join("urls.txt"), format!("{URL_A}\n{URL_B}\n")).unwrap();
    std::fs::write(dir.join("vpns.txt"), "r1\n").unwrap();
    let database = json!({
        "accounts": [
            {
                "account_token": "1111222233334444",
                "device_id": "aaaa-bbbb",
                "device_name": "gifted krill",
                "device_private_key": "AAAA=",
                "device_ipv4_address": "10.64.10.49/32",
                "device_ipv6_address": "fc00::a40:a31/128"
            },
            {
                "account_token": "5555666677778888",
                "device_id": "cccc-dddd",
                "device_name": "humble otter",
                "device_private_key": "BBBB=",
                "device_ipv4_address": "10.64.10.50/32",
                "device_ipv6_address": "fc00::a40:a32/128"
            }
        ]
    });
    std::fs::write(dir.join("accounts.json"), database.to_string()).unwrap();
}

fn config_in(dir: &std::path::Path, samples: u32) -> Config {
    Config {
        datadir: dir.join("data"),
        urllist: dir.join("urls.txt"),
        vpnlist: dir.join("vpns.txt"),
        database: dir.join("accounts.json"),
        samples,
        visits: 4,
        host: "127.0.0.1".to_string(),
        port: 0,
        allow_http: false,
        skip_relay_check: true,
        shuffle_seed: Some(1),
        limits: test_limits(),
        worker: WorkerProfile::default(),
    }
}

/// Bootstrap a coordinator over `dir` and serve it on an ephemeral port.
async fn serve(dir: &std::path::Path, samples: u32) -> String {
    let coordinator = Arc::new(Coordinator::bootstrap(config_in(dir, samples)).await.unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::router(coordinator);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn post_sample(
    client: &reqwest::Client,
    base: &str,
    url: &str,
    daita: &str,
    pcap_len: usize,
) -> reqwest::Response {
    let png_hex = hex::encode(vec![1u8; 2048]);
    let pcap_hex = hex::encode(vec![2u8; pcap_len]);
    client
        .post(format!("{base}/work"))
        .form(&[
            ("id", "w1"),
            ("url", url),
            ("vpn", "r1"),
            ("daita", daita),
            ("png_data", png_hex.as_str()),
            ("pcap_data", pcap_hex.as_str()),
            ("metadata", r#"{"qoe": 0.8}"#),
        ])
        .send()
        .await
        .unwrap()
}

async fn body(response: reqwest::Response) -> Value {
    serde_json::from_str(&response.text().await.unwrap()).unwrap()
}

// =============================================================================
// BASICS
// =============================================================================

#[tokio::test]
async fn test_index_lists_endpoints() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 2).await;

    let text = reqwest::get(&base).await.unwrap().text().await.unwrap();
    for endpoint in ["/setup", "/server", "/work", "/status"] {
        assert!(text.contains(endpoint), "index missing {endpoint}");
    }
}

#[tokio::test]
async fn test_setup_assigns_sticky_accounts() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 2).await;
    let client = reqwest::Client::new();

    let missing = client.get(format!("{base}/setup")).send().await.unwrap();
    assert_eq!(missing.status(), 400);

    let first = body(client.get(format!("{base}/setup?id=w1")).send().await.unwrap()).await;
    assert_eq!(first["visit_count"], 4);
    assert_eq!(first["display_size"], json!([1920, 1080]));
    assert_eq!(first["daita"], json!(["off", "on"]));
    assert!(first["grace"].is_number());
    assert!(first["min_wait"].is_number());
    assert!(first["post_browser_pre_capture_wait"].is_number());
    let token = first["account"]["account_token"].as_str().unwrap().to_string();

    let again = body(client.get(format!("{base}/setup?id=w1")).send().await.unwrap()).await;
    assert_eq!(again["account"]["account_token"], Value::String(token.clone()));

    let other = body(client.get(format!("{base}/setup?id=w2")).send().await.unwrap()).await;
    assert_ne!(other["account"]["account_token"], Value::String(token));

    // Pool of two is now empty
    let exhausted = client.get(format!("{base}/setup?id=w3")).send().await.unwrap();
    assert_eq!(exhausted.status(), 400);
    assert_eq!(body(exhausted).await["error"], "no available accounts remain");
}

// =============================================================================
// ROTATION AND WORK SELECTION
// =============================================================================

#[tokio::test]
async fn test_server_rotates_away_from_current_pair() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 2).await;
    let client = reqwest::Client::new();

    let missing = client.get(format!("{base}/server?id=w1")).send().await.unwrap();
    assert_eq!(missing.status(), 400);

    let fresh = body(
        client
            .get(format!("{base}/server?id=w1&server=None&daita=off"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(fresh["vpn"], "r1");

    // Both (r1, off) and (r1, on) are open; a worker on (r1, off) must
    // always be moved to the other pair.
    for _ in 0..20 {
        let pair = body(
            client
                .get(format!("{base}/server?id=w1&server=r1&daita=off"))
                .send()
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(pair["vpn"], "r1");
        assert_eq!(pair["daita"], "on");
    }
}

#[tokio::test]
async fn test_work_conflict_means_rotate() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 1).await;
    let client = reqwest::Client::new();

    let unassigned = client
        .get(format!("{base}/work?id=w1&server=None&daita=off"))
        .send()
        .await
        .unwrap();
    assert_eq!(unassigned.status(), 409);

    let work = body(
        client
            .get(format!("{base}/work?id=w1&server=r1&daita=off"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    let url = work["url"].as_str().unwrap();
    assert!(url == URL_A || url == URL_B);
    assert_eq!(work["vpn"], "r1");
    assert_eq!(work["daita"], "off");

    // Exhaust (r1, off): one sample per URL at samples=1
    for url in [URL_A, URL_B] {
        let response = post_sample(&client, &base, url, "off", 2048).await;
        assert_eq!(body(response).await["status"], "ok");
    }

    let exhausted = client
        .get(format!("{base}/work?id=w1&server=r1&daita=off"))
        .send()
        .await
        .unwrap();
    assert_eq!(exhausted.status(), 409);

    let open = client
        .get(format!("{base}/work?id=w1&server=r1&daita=on"))
        .send()
        .await
        .unwrap();
    assert_eq!(open.status(), 200);
}

// =============================================================================
// SUBMISSION
// =============================================================================

#[tokio::test]
async fn test_post_work_validation() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 2).await;
    let client = reqwest::Client::new();

    // Missing fields
    let response = client
        .post(format!("{base}/work"))
        .form(&[("id", "w1"), ("url", URL_A)])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Undecodable hex
    let response = client
        .post(format!("{base}/work"))
        .form(&[
            ("id", "w1"),
            ("url", URL_A),
            ("vpn", "r1"),
            ("daita", "off"),
            ("png_data", "zz"),
            ("pcap_data", "00"),
            ("metadata", "{}"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Malformed metadata
    let response = client
        .post(format!("{base}/work"))
        .form(&[
            ("id", "w1"),
            ("url", URL_A),
            ("vpn", "r1"),
            ("daita", "off"),
            ("png_data", "00"),
            ("pcap_data", "00"),
            ("metadata", "not json"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Unknown relay is a bad request, not a silent decline
    let png_hex = hex::encode(vec![1u8; 2048]);
    let pcap_hex = hex::encode(vec![2u8; 2048]);
    let response = client
        .post(format!("{base}/work"))
        .form(&[
            ("id", "w1"),
            ("url", URL_A),
            ("vpn", "r9"),
            ("daita", "off"),
            ("png_data", png_hex.as_str()),
            ("pcap_data", pcap_hex.as_str()),
            ("metadata", "{}"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_pcap_bounds_are_inclusive() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 2).await;
    let client = reqwest::Client::new();
    let limits = test_limits();

    // Below minimum: declined with 200, nothing counted
    let response = post_sample(&client, &base, URL_A, "off", limits.min_pcap - 1).await;
    assert_eq!(response.status(), 200);
    assert_eq!(body(response).await["status"], "rejected");

    // Exactly at both bounds: accepted
    let response = post_sample(&client, &base, URL_A, "off", limits.min_pcap).await;
    assert_eq!(body(response).await["status"], "ok");
    let response = post_sample(&client, &base, URL_A, "off", limits.max_pcap).await;
    assert_eq!(body(response).await["status"], "ok");

    // Above maximum: declined
    let response = post_sample(&client, &base, URL_B, "off", limits.max_pcap + 1).await;
    assert_eq!(body(response).await["status"], "rejected");

    let status = body(client.get(format!("{base}/status")).send().await.unwrap()).await;
    assert_eq!(status["total_collected"], 2);
}

#[tokio::test]
async fn test_full_cell_absorbs_excess_submissions() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 1).await;
    let client = reqwest::Client::new();

    let response = post_sample(&client, &base, URL_A, "on", 2048).await;
    let accepted = body(response).await;
    assert_eq!(accepted["status"], "ok");
    assert_eq!(accepted["sample"], 0);

    let response = post_sample(&client, &base, URL_A, "on", 2048).await;
    assert_eq!(response.status(), 200);
    assert_eq!(body(response).await["status"], "already-done");

    let status = body(client.get(format!("{base}/status")).send().await.unwrap()).await;
    assert_eq!(status["total_collected"], 1);
}

// =============================================================================
// STATUS
// =============================================================================

#[tokio::test]
async fn test_status_reports_progress_and_clients() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 2).await;
    let client = reqwest::Client::new();

    client.get(format!("{base}/setup?id=w1")).send().await.unwrap();
    client
        .get(format!("{base}/server?id=w1&server=None&daita=off"))
        .send()
        .await
        .unwrap();
    client
        .get(format!("{base}/work?id=w2&server=r1&daita=on"))
        .send()
        .await
        .unwrap();

    let status = body(client.get(format!("{base}/status")).send().await.unwrap()).await;
    // 2 modes × 2 samples × 2 urls × 1 relay
    assert_eq!(status["total_to_collect"], 8);
    assert_eq!(status["total_collected"], 0);
    assert_eq!(status["allocated_accounts"], "1/2");
    assert_eq!(status["unique_clients"], json!(["w1", "w2"]));
    assert!(status["elapsed"].as_f64().unwrap() >= 0.0);
    assert!(status["last_update"].as_f64().unwrap() >= 0.0);
}

// =============================================================================
// RESTART
// =============================================================================

#[tokio::test]
async fn test_restart_reports_previous_progress() {
    let tmp = tempfile::tempdir().unwrap();
    write_inputs(tmp.path());
    let base = serve(tmp.path(), 2).await;
    let client = reqwest::Client::new();

    for (url, daita) in [(URL_A, "off"), (URL_A, "off"), (URL_B, "on")] {
        let response = post_sample(&client, &base, url, daita, 2048).await;
        assert_eq!(body(response).await["status"], "ok");
    }

    // Second coordinator over the same data directory
    let base2 = serve(tmp.path(), 2).await;
    let status = body(client.get(format!("{base2}/status")).send().await.unwrap()).await;
    assert_eq!(status["total_collected"], 3);

    // The closed cell is not handed out again: (r1, off) only has b.test left
    for _ in 0..20 {
        let work = body(
            client
                .get(format!("{base2}/work?id=w1&server=r1&daita=off"))
                .send()
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(work["url"], URL_B);
    }
}
