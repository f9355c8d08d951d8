//! End-to-end recording scenarios across the full message fabric.

use std::{sync::Arc, time::Duration};

use forkrec::{
    test_utils::{FakeProvisioner, ScriptedForkRpc},
    BusEndpoint, CallOutcome, DocumentContext, ForkProvider, MemoryStore, Message, MessageKind,
    Relay, RpcCall, SessionRouter, Store, TransactionStatus, WindowId,
};
use serde_json::{json, Value};

type TestRouter =
    SessionRouter<Arc<FakeProvisioner>, Arc<ScriptedForkRpc>, MemoryStore>;

struct Fixture {
    router: Arc<TestRouter>,
    provisioner: Arc<FakeProvisioner>,
    rpc: Arc<ScriptedForkRpc>,
    store: MemoryStore,
    /// Panel-side endpoint of the trusted channel; lifecycle broadcasts land
    /// here.
    panel: BusEndpoint,
}

fn fixture() -> Fixture {
    let store = MemoryStore::new();
    let provisioner = Arc::new(FakeProvisioner::new());
    let rpc = Arc::new(ScriptedForkRpc::new());
    let (panel, trusted) = BusEndpoint::pair();
    let router = Arc::new(SessionRouter::new(
        Arc::clone(&provisioner),
        Arc::clone(&rpc),
        store.clone(),
        trusted,
    ));
    Fixture { router, provisioner, rpc, store, panel }
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn send_tx_call() -> RpcCall {
    RpcCall::new(
        "eth_sendTransaction",
        json!([{
            "from": "0x00000000000000000000000000000000000a11ce",
            "to": "0x000000000000000000000000000000000000b0b0",
            "data": "0x",
            "value": "0x1"
        }]),
    )
}

#[tokio::test]
async fn record_confirm_rollback_releases_fork() {
    let Fixture { router, provisioner, store, .. } = fixture();
    let window = WindowId(7);

    router.start_session(window, 1, None).await.unwrap();
    assert!(router.is_recording(window).await);
    assert_eq!(provisioner.active_forks().len(), 1);

    // Intercepted state-changing call: recorded, executed, confirmed.
    let outcome = router.handle_call(window, send_tx_call()).await.unwrap();
    assert!(matches!(outcome, CallOutcome::Response(Value::String(_))));

    let record = router
        .with_ledger(window, |ledger| ledger.records().to_vec())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(record.status, TransactionStatus::Executed);
    assert!(record.receipt.is_some());

    // Rolling back before the only record empties the ledger and tears the
    // fork down.
    router.rollback(window, &record.id).await.unwrap();
    assert!(router.with_ledger(window, |_| ()).await.is_none());
    assert!(provisioner.active_forks().is_empty());
    assert!(!router.is_recording(window).await);
    // The persisted ledger is gone with the session.
    assert!(store.get_raw("ledgers[7]").is_none());
}

#[tokio::test]
async fn provider_call_travels_page_relay_router_and_back() {
    let Fixture { router, panel, .. } = fixture();
    tokio::spawn(Arc::clone(&router).run());

    // Page fabric: bridge <-> relay <-> trusted channel.
    let (page, relay_page) = BusEndpoint::pair();
    let mut document = DocumentContext::new();
    let relay = Relay::attach(&mut document, relay_page, panel.clone()).unwrap();
    tokio::spawn(relay.run());

    let window = WindowId(7);
    router.start_session(window, 1, None).await.unwrap();

    let provider = ForkProvider::new(page, window).with_timeout(Duration::from_secs(2));
    let hash = provider.request(send_tx_call()).await.unwrap();
    assert!(hash.as_str().unwrap().starts_with("0x"));

    let records = router.with_ledger(window, |l| l.records().to_vec()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TransactionStatus::Executed);
}

#[tokio::test]
async fn unconfirmed_transaction_stays_pending_until_confirmed() {
    let Fixture { router, rpc, .. } = fixture();
    let window = WindowId(2);
    router.start_session(window, 1, None).await.unwrap();

    // Fork returns a hash but no receipt yet.
    rpc.respond_with("eth_getTransactionReceipt", Value::Null);
    router.handle_call(window, send_tx_call()).await.unwrap();

    let record = router
        .with_ledger(window, |l| l.records().to_vec())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(record.status, TransactionStatus::Pending);

    router
        .confirm_transaction(window, &record.id, json!({ "status": "0x1" }))
        .await
        .unwrap();
    let record = router
        .with_ledger(window, |l| l.records().to_vec())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(record.status, TransactionStatus::Executed);
}

#[tokio::test]
async fn reads_proxy_to_fork_without_touching_ledger() {
    let Fixture { router, rpc, .. } = fixture();
    let window = WindowId(3);
    router.start_session(window, 1, None).await.unwrap();

    let outcome =
        router.handle_call(window, RpcCall::new("eth_chainId", json!([]))).await.unwrap();
    assert_eq!(outcome, CallOutcome::Response(json!("0x1")));
    assert!(router.with_ledger(window, |l| l.is_empty()).await.unwrap());

    // The read went to the provisioned fork's endpoint.
    let calls = rpc.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0.host_str().unwrap().starts_with("fork-1-"));
}

#[tokio::test]
async fn call_without_session_passes_through() {
    let Fixture { router, rpc, .. } = fixture();
    let call = RpcCall::new("eth_chainId", json!([]));
    let outcome = router.handle_call(WindowId(99), call.clone()).await.unwrap();
    assert_eq!(outcome, CallOutcome::Passthrough(call));
    assert!(rpc.calls().is_empty());
}

#[tokio::test]
async fn failed_provisioning_refuses_calls_and_stop_is_noop() {
    let Fixture { router, provisioner, panel, .. } = fixture();
    let mut failures = panel.subscribe(MessageKind::ForkFailed);
    let window = WindowId(4);

    provisioner.fail_next_create();
    router.start_session(window, 1, None).await.unwrap_err();

    // The failure is broadcast for the recording UI.
    let envelope = failures.recv().await.unwrap();
    assert!(matches!(envelope.message, Message::ForkFailed { window_id, .. } if window_id == window));

    // The fork-less session refuses calls instead of leaking them.
    let err = router
        .handle_call(window, RpcCall::new("eth_chainId", json!([])))
        .await
        .unwrap_err();
    assert_eq!(err.code, forkrec::error_codes::RESOURCE_UNAVAILABLE);

    // Stopping a session that never provisioned is a clean no-op.
    router.stop_session(window).await.unwrap();
    assert!(provisioner.created_forks().is_empty());
}

#[tokio::test]
async fn double_start_leaves_exactly_one_fork_for_the_second_start() {
    let Fixture { router, provisioner, panel, .. } = fixture();
    tokio::spawn(Arc::clone(&router).run());
    let mut started = panel.subscribe(MessageKind::ForkStarted);
    let window = WindowId(7);

    // Two back-to-back lifecycle messages for the same window.
    panel.send(Message::ForkStart { window_id: window, chain_id: 1, rpc_url: None });
    panel.send(Message::ForkStart { window_id: window, chain_id: 1, rpc_url: None });

    started.recv().await.unwrap();
    started.recv().await.unwrap();

    let active = provisioner.active_forks();
    assert_eq!(active.len(), 1, "exactly one fork may be attributed to the window");
    // The survivor is the second fork created.
    assert_eq!(active[0], provisioner.created_forks()[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_sent_after_start_always_ends_the_session() {
    for _ in 0..20 {
        let Fixture { router, provisioner, panel, .. } = fixture();
        tokio::spawn(Arc::clone(&router).run());
        let mut stopped = panel.subscribe(MessageKind::ForkStopped);
        let window = WindowId(1);

        // The last lifecycle command sent must be the last one applied.
        panel.send(Message::ForkStart { window_id: window, chain_id: 1, rpc_url: None });
        panel.send(Message::ForkStop { window_id: window });

        stopped.recv().await.unwrap();
        assert!(!router.is_recording(window).await);
        assert!(provisioner.active_forks().is_empty(), "fork survived a stop sent after start");
    }
}

#[tokio::test]
async fn rejected_write_leaves_concurrent_records_intact() {
    let Fixture { router, rpc, .. } = fixture();
    let window = WindowId(11);
    router.start_session(window, 1, None).await.unwrap();

    // The first send stalls and is then rejected by the fork; a second send
    // lands and confirms while the first is still in flight.
    rpc.stall_next("eth_sendTransaction", Duration::from_millis(50));
    rpc.fail_once_with("eth_sendTransaction", forkrec::RpcError::user_rejected());

    let slow = tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.handle_call(window, send_tx_call()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    router.handle_call(window, send_tx_call()).await.unwrap();

    let err = slow.await.unwrap().unwrap_err();
    assert_eq!(err.code, forkrec::error_codes::USER_REJECTED);

    let records = router.with_ledger(window, |l| l.records().to_vec()).await.unwrap();
    assert_eq!(records.len(), 1, "cleanup of the rejected call removed an unrelated record");
    assert_eq!(records[0].status, TransactionStatus::Executed);
}

#[tokio::test]
async fn save_and_delete_route_maintain_last_used_pointer() {
    let Fixture { router, store, panel, .. } = fixture();
    tokio::spawn(Arc::clone(&router).run());

    panel.send(Message::SaveRoute {
        route_id: "abc-123".into(),
        data: json!({ "chain": 1, "avatar": "0x00000000000000000000000000000000000a11ce" }),
    });
    wait_for(|| store.get_raw("routes[abc-123]").is_some()).await;
    assert_eq!(store.get_raw("last-used-route"), Some(json!("abc-123")));

    panel.send(Message::DeleteRoute { route_id: "abc-123".into() });
    wait_for(|| store.get_raw("routes[abc-123]").is_none()).await;
    assert_eq!(store.get_raw("last-used-route"), None, "pointer left dangling after delete");
}

#[tokio::test]
async fn update_swaps_fork_and_keeps_ledger() {
    let Fixture { router, provisioner, .. } = fixture();
    let window = WindowId(5);
    router.start_session(window, 1, None).await.unwrap();
    router.handle_call(window, send_tx_call()).await.unwrap();

    let first_fork = provisioner.created_forks()[0].clone();
    router
        .update_session(window, "http://mainnet.invalid/rpc".parse().unwrap())
        .await
        .unwrap();

    // New fork live, old one released, ledger untouched.
    let active = provisioner.active_forks();
    assert_eq!(active.len(), 1);
    assert_ne!(active[0], first_fork);
    let records = router.with_ledger(window, |l| l.records().to_vec()).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn ledger_survives_panel_reload_via_store() {
    let Fixture { router, store, .. } = fixture();
    let window = WindowId(6);
    router.start_session(window, 1, None).await.unwrap();
    router.handle_call(window, send_tx_call()).await.unwrap();

    // A reloading panel reconstructs the ledger straight from storage.
    let reloaded = forkrec::TransactionLedger::load(&store, window).unwrap();
    assert_eq!(reloaded.records().len(), 1);
    assert_eq!(reloaded.records()[0].status, TransactionStatus::Executed);
}

#[tokio::test]
async fn rejected_transaction_leaves_no_record() {
    let Fixture { router, rpc, .. } = fixture();
    let window = WindowId(8);
    router.start_session(window, 1, None).await.unwrap();

    rpc.fail_with("eth_sendTransaction", forkrec::RpcError::user_rejected());
    let err = router.handle_call(window, send_tx_call()).await.unwrap_err();
    assert_eq!(err.code, forkrec::error_codes::USER_REJECTED);
    assert!(router.with_ledger(window, |l| l.is_empty()).await.unwrap());
}
