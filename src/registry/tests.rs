//! Unit tests for the registry client.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rstest::{fixture, rstest};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_support::{ScriptedRegistry, node, reservation_result, unix_now};

const NOW: i64 = 1_700_000_000;

fn fast_policy(max_polls: u32) -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(1),
        max_polls,
    }
}

fn active(window_secs: u64) -> NodeFilter {
    NodeFilter::RecentlyActive {
        window: Duration::from_secs(window_secs),
        now: NOW,
    }
}

#[fixture]
fn nodes() -> Vec<Node> {
    vec![
        node("fresh-public-big", NOW - 10, 500, true),
        node("fresh-private-big", NOW - 10, 500, false),
        node("stale-public-big", NOW - 3_600, 500, true),
        node("fresh-public-small", NOW - 10, 10, true),
    ]
}

fn ids(nodes: &[Node]) -> Vec<&str> {
    nodes.iter().map(|node| node.id.as_str()).collect()
}

#[rstest]
fn no_filters_keep_every_node_in_order(nodes: Vec<Node>) {
    let expected = nodes.clone();
    assert_eq!(apply_filters(nodes, &[]), expected);
}

#[rstest]
#[case::recent(vec![active(600)], vec!["fresh-public-big", "fresh-private-big", "fresh-public-small"])]
#[case::public(vec![NodeFilter::public_connectivity()], vec!["fresh-public-big", "stale-public-big", "fresh-public-small"])]
#[case::recent_and_public(
    vec![active(600), NodeFilter::public_connectivity()],
    vec!["fresh-public-big", "fresh-public-small"]
)]
#[case::all_three(
    vec![
        active(600),
        NodeFilter::public_connectivity(),
        NodeFilter::min_capacity(CapacityKind::Sru, 10),
    ],
    vec!["fresh-public-big"]
)]
fn filters_are_conjunctive(
    nodes: Vec<Node>,
    #[case] filters: Vec<NodeFilter>,
    #[case] expected: Vec<&str>,
) {
    let kept = apply_filters(nodes, &filters);
    assert_eq!(ids(&kept), expected);
}

#[rstest]
#[case::at_threshold(10, false)]
#[case::above_threshold(11, true)]
#[case::below_threshold(3, false)]
fn min_capacity_is_strictly_greater(#[case] sru: u64, #[case] expected: bool) {
    let filter = NodeFilter::min_capacity(CapacityKind::Sru, 10);
    assert_eq!(filter.matches(&node("n", NOW, sru, true)), expected);
}

#[rstest]
#[case::just_inside(599, true)]
#[case::at_window(600, false)]
#[case::future_heartbeat(-5, true)]
fn heartbeat_age_must_be_inside_window(#[case] age: i64, #[case] expected: bool) {
    assert_eq!(active(600).matches(&node("n", NOW - age, 0, false)), expected);
}

#[rstest]
fn shuffle_keeps_the_same_nodes(nodes: Vec<Node>) {
    let mut shuffled = nodes.clone();
    shuffle_nodes(&mut shuffled, &mut StdRng::seed_from_u64(7));

    let mut before = ids(&nodes);
    let mut after = ids(&shuffled);
    before.sort_unstable();
    after.sort_unstable();
    assert_eq!(before, after);
}

#[rstest]
fn node_wire_shape_decodes() {
    let raw = json!([
        {
            "node_id": "abc",
            "updated": 1_700_000_000,
            "total_resources": {"cru": 4, "mru": 8, "hru": 0, "sru": 256},
            "public_config": {"ipv4": "185.0.0.1/24"}
        },
        {"node_id": "def", "updated": 1}
    ]);
    let decoded: Vec<Node> = serde_json::from_value(raw).expect("nodes decode");
    assert_eq!(decoded.len(), 2);
    let first = decoded.first().expect("first node");
    assert!(first.has_public_connectivity());
    assert_eq!(first.capacity.get(CapacityKind::Sru), 256);
    let second = decoded.get(1).expect("second node");
    assert!(!second.has_public_connectivity());
    assert_eq!(second.capacity, NodeCapacity::default());
}

#[rstest]
fn storage_payload_decodes_for_zdb_reservations() {
    let result = reservation_result(
        "7",
        ReservationKind::Zdb,
        ReservationState::Ok,
        json!({"Namespace": "ns7", "IP": "2a02::1", "Port": 9900}),
    );
    let payload: StoragePayload = result.payload().expect("payload decodes");
    assert_eq!(
        payload,
        StoragePayload {
            namespace: String::from("ns7"),
            ip: String::from("2a02::1"),
            port: 9900,
        }
    );
}

#[rstest]
fn payload_kind_mismatch_is_reported() {
    let result = reservation_result(
        "8",
        ReservationKind::Container,
        ReservationState::Ok,
        json!({}),
    );
    let err = result
        .payload::<StoragePayload>()
        .expect_err("container is not zdb");
    assert_eq!(
        err,
        RegistryError::PayloadMismatch {
            id: String::from("8"),
            expected: ReservationKind::Zdb,
            actual: ReservationKind::Container,
        }
    );
}

#[rstest]
fn malformed_payload_is_a_decode_error() {
    let result = reservation_result(
        "9",
        ReservationKind::Zdb,
        ReservationState::Ok,
        json!({"Namespace": "ns"}),
    );
    let err = result
        .payload::<StoragePayload>()
        .expect_err("missing fields");
    assert!(matches!(err, RegistryError::PayloadDecode { ref id, .. } if id == "9"));
}

#[rstest]
fn unknown_wire_state_and_kind_decode_as_unknown() {
    let raw = json!({"id": "1", "type": "gateway", "state": "paused"});
    let result: ReservationResult = serde_json::from_value(raw).expect("result decodes");
    assert_eq!(result.kind, ReservationKind::Unknown);
    assert_eq!(result.state, ReservationState::Unknown);
    assert!(!result.state.is_terminal());
}

#[rstest]
#[tokio::test]
async fn list_nodes_applies_filters_to_fetched_nodes(nodes: Vec<Node>) {
    let registry = ScriptedRegistry::new();
    registry.set_nodes(nodes);
    let client = RegistryClient::new(registry.clone());

    let listed = client
        .list_nodes(&[NodeFilter::public_connectivity()])
        .await
        .expect("nodes listed");
    assert_eq!(listed.len(), 3);
    assert_eq!(registry.node_fetches(), 1);
}

#[rstest]
#[tokio::test]
async fn list_nodes_surfaces_outages() {
    let registry = ScriptedRegistry::new();
    registry.fail_nodes();
    let err = RegistryClient::new(registry)
        .list_nodes(&[])
        .await
        .expect_err("outage");
    assert!(matches!(err, RegistryError::Unavailable { .. }));
}

#[rstest]
#[case::ok(ReservationState::Ok)]
#[case::error(ReservationState::Error)]
#[tokio::test]
async fn await_all_returns_terminal_results(#[case] terminal: ReservationState) {
    let registry = ScriptedRegistry::new();
    registry.script_states(
        "r1",
        ReservationKind::Zdb,
        &[ReservationState::Pending, ReservationState::Deploy, terminal],
    );
    let client = RegistryClient::new(registry.clone());

    let results = client
        .await_all(
            &[ReservationId::new("r1")],
            &fast_policy(5),
            &CancellationToken::new(),
        )
        .await
        .expect("reservation converges");

    let states = results.iter().map(|r| r.state).collect::<Vec<_>>();
    assert_eq!(states, vec![terminal]);
    assert_eq!(registry.fetch_count("r1"), 3);
}

#[rstest]
#[tokio::test]
async fn await_all_times_out_after_the_poll_budget() {
    let registry = ScriptedRegistry::new();
    registry.script_states("slow", ReservationKind::Network, &[ReservationState::Deploy]);
    let client = RegistryClient::new(registry.clone());

    let err = client
        .await_all(
            &[ReservationId::new("slow")],
            &fast_policy(4),
            &CancellationToken::new(),
        )
        .await
        .expect_err("never converges");

    assert_eq!(
        err,
        RegistryError::ProvisionTimeout {
            id: ReservationId::new("slow"),
            polls: 4,
        }
    );
    assert_eq!(registry.fetch_count("slow"), 4);
}

#[rstest]
#[tokio::test]
async fn await_all_stops_polling_after_the_first_timeout() {
    let registry = ScriptedRegistry::new();
    registry.script_states("a", ReservationKind::Zdb, &[ReservationState::Ok]);
    registry.script_states("b", ReservationKind::Zdb, &[ReservationState::Pending]);
    registry.script_states("c", ReservationKind::Zdb, &[ReservationState::Ok]);
    let client = RegistryClient::new(registry.clone());

    let ids = ["a", "b", "c"].map(ReservationId::new);
    let err = client
        .await_all(&ids, &fast_policy(2), &CancellationToken::new())
        .await
        .expect_err("b times out");

    assert!(matches!(err, RegistryError::ProvisionTimeout { ref id, .. } if id.as_str() == "b"));
    assert_eq!(registry.fetch_count("a"), 1);
    assert_eq!(registry.fetch_count("b"), 2);
    assert_eq!(registry.fetch_count("c"), 0);
}

#[rstest]
#[tokio::test]
async fn await_all_preserves_input_order() {
    let registry = ScriptedRegistry::new();
    registry.script_states("second", ReservationKind::Zdb, &[ReservationState::Ok]);
    registry.script_states(
        "first",
        ReservationKind::Zdb,
        &[ReservationState::Pending, ReservationState::Ok],
    );
    let client = RegistryClient::new(registry);

    let results = client
        .await_all(
            &[ReservationId::new("first"), ReservationId::new("second")],
            &fast_policy(3),
            &CancellationToken::new(),
        )
        .await
        .expect("both converge");
    let order = results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
    assert_eq!(order, vec!["first", "second"]);
}

#[rstest]
#[tokio::test]
async fn cancelled_token_abandons_the_wait() {
    let registry = ScriptedRegistry::new();
    registry.script_states("r", ReservationKind::Zdb, &[ReservationState::Pending]);
    let client = RegistryClient::new(registry.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client
        .await_all(&[ReservationId::new("r")], &fast_policy(20), &cancel)
        .await
        .expect_err("cancelled");
    assert_eq!(
        err,
        RegistryError::Cancelled {
            id: ReservationId::new("r"),
        }
    );
    assert_eq!(registry.fetch_count("r"), 0);
}

#[rstest]
#[tokio::test]
async fn cancellation_interrupts_the_poll_sleep() {
    let registry = ScriptedRegistry::new();
    registry.script_states("r", ReservationKind::Zdb, &[ReservationState::Pending]);
    let client = RegistryClient::new(registry.clone());
    let cancel = CancellationToken::new();
    let policy = PollPolicy {
        interval: Duration::from_secs(3_600),
        max_polls: 5,
    };

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = client
        .await_all(&[ReservationId::new("r")], &policy, &cancel)
        .await
        .expect_err("cancelled mid-sleep");
    assert!(matches!(err, RegistryError::Cancelled { .. }));
    assert_eq!(registry.fetch_count("r"), 1);
}

#[rstest]
#[tokio::test]
async fn select_node_picks_a_recent_public_node() {
    let now = unix_now();
    let registry = ScriptedRegistry::new();
    registry.set_nodes(vec![
        node("private", now, 100, false),
        node("stale", now - 7_200, 100, true),
        node("chosen", now, 100, true),
    ]);
    let client = RegistryClient::new(registry);

    let picked = select_node(
        &client,
        Duration::from_secs(600),
        &mut StdRng::seed_from_u64(1),
    )
    .await
    .expect("one eligible node");
    assert_eq!(picked, "chosen");
}

#[rstest]
#[tokio::test]
async fn select_node_without_candidates_fails() {
    let registry = ScriptedRegistry::new();
    registry.set_nodes(vec![node("private", unix_now(), 100, false)]);
    let client = RegistryClient::new(registry);

    let err = select_node(
        &client,
        Duration::from_secs(600),
        &mut StdRng::seed_from_u64(1),
    )
    .await
    .expect_err("no candidates");
    assert_eq!(err, RegistryError::NoEligibleNodes);
}

/// Serves `responses` to successive connections and returns the base URL.
fn serve(responses: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("listener address");
    thread::spawn(move || {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut buf = [0_u8; 4096];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{addr}/explorer/")
}

#[rstest]
fn endpoint_appends_segments_to_the_base_path() {
    let registry = HttpRegistry::new("https://registry.test/explorer/").expect("valid url");
    assert_eq!(
        registry.endpoint(&["reservations", "42"]).as_str(),
        "https://registry.test/explorer/reservations/42"
    );
}

#[rstest]
fn client_initialisation_failures_are_reported() {
    let builder = reqwest::Client::builder().use_preconfigured_tls(());
    let err = http::build_client(builder).expect_err("unknown tls backend");
    assert!(
        matches!(err, RegistryError::Transport { ref message } if !message.is_empty()),
        "unexpected error: {err}"
    );
}

#[rstest]
#[case::not_a_url("not a url")]
#[case::no_path("mailto:ops@example.com")]
fn invalid_base_urls_are_rejected(#[case] url: &str) {
    let err = HttpRegistry::new(url).expect_err("invalid url");
    assert!(matches!(err, RegistryError::InvalidBaseUrl { .. }));
}

#[rstest]
#[tokio::test]
async fn http_registry_decodes_nodes_and_reservations() {
    let base = serve(vec![
        (200, String::from(r#"[{"node_id":"n1","updated":5,"public_config":{}}]"#)),
        (
            200,
            String::from(
                r#"{"result":{"id":"42","type":"zdb","state":"ok","error":"","data":{"Namespace":"ns","IP":"::1","Port":9900}}}"#,
            ),
        ),
    ]);
    let client = RegistryClient::http(&base).expect("client");

    let nodes = client.list_nodes(&[]).await.expect("nodes");
    assert_eq!(ids(&nodes), vec!["n1"]);

    let result = client
        .fetch_result(&ReservationId::new("42"))
        .await
        .expect("reservation");
    assert_eq!(result.state, ReservationState::Ok);
    let payload: StoragePayload = result.payload().expect("zdb payload");
    assert_eq!(payload.port, 9900);
}

#[rstest]
#[case::server_error(500, String::from("oops"))]
#[case::not_json(200, String::from("<html>"))]
#[tokio::test]
async fn http_registry_maps_failures_to_unavailable(#[case] status: u16, #[case] body: String) {
    let base = serve(vec![(status, body)]);
    let client = RegistryClient::http(&base).expect("client");

    let err = client.list_nodes(&[]).await.expect_err("unavailable");
    assert!(matches!(err, RegistryError::Unavailable { ref endpoint, .. } if endpoint.ends_with("/explorer/nodes")));
}

#[rstest]
#[tokio::test]
async fn http_registry_reports_refused_connections() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        listener.local_addr().expect("listener address")
    };
    let client = RegistryClient::http(&format!("http://{addr}/")).expect("client");

    let err = client
        .fetch_result(&ReservationId::new("1"))
        .await
        .expect_err("connection refused");
    assert!(matches!(err, RegistryError::Unavailable { .. }));
}
