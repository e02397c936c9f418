//! Multi-agent flows over real sockets: coalitions, analysis fan-out,
//! micropayments, and market update pushes.

mod common;

use common::{connect_client, spawn_default_server};
use parley::protocol::messages::{notifications, AnalysisSubmission};
use rust_decimal_macros::dec;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capture notifications of one method into a channel.
fn capture(client: &parley::client::AgentClient, method: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(method, move |params| {
        let _ = tx.send(params);
    });
    rx
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Value>, secs: u64) -> Value {
    tokio::time::timeout(Duration::from_secs(secs), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

#[tokio::test]
async fn two_agents_see_each_other_in_coalitions() {
    let server = spawn_default_server().await;
    let client_a = connect_client(&server).await;
    let client_b = connect_client(&server).await;
    let agent_a = client_a.agent_id().await.unwrap();
    let agent_b = client_b.agent_id().await.unwrap();

    // Both propose, then each joins the other's coalition.
    let (coalition_a, _) = client_a
        .propose_coalition("Alpha", "market-123", "momentum", 2, 5)
        .await
        .unwrap();
    let (coalition_b, _) = client_b
        .propose_coalition("Alpha", "market-123", "momentum", 2, 5)
        .await
        .unwrap();

    let view_a = client_a.join_coalition(&coalition_b).await.unwrap();
    let view_b = client_b.join_coalition(&coalition_a).await.unwrap();

    assert!(view_a.members.contains(&agent_a) && view_a.members.contains(&agent_b));
    assert!(view_b.members.contains(&agent_a) && view_b.members.contains(&agent_b));

    client_a.disconnect().await;
    client_b.disconnect().await;
}

#[tokio::test]
async fn leaving_removes_only_the_leaver() {
    let server = spawn_default_server().await;
    let client_a = connect_client(&server).await;
    let client_b = connect_client(&server).await;
    let agent_a = client_a.agent_id().await.unwrap();
    let agent_b = client_b.agent_id().await.unwrap();

    let (coalition_id, _) = client_a
        .propose_coalition("Alpha", "market-123", "momentum", 2, 5)
        .await
        .unwrap();
    client_b.join_coalition(&coalition_id).await.unwrap();
    client_a.leave_coalition(&coalition_id).await.unwrap();

    // Dedup join returns the current state without adding b twice.
    let view = client_b.join_coalition(&coalition_id).await.unwrap();
    assert!(!view.members.contains(&agent_a));
    assert_eq!(view.members, vec![agent_b]);

    client_a.disconnect().await;
    client_b.disconnect().await;
}

#[tokio::test]
async fn joining_unknown_coalition_reports_not_found() {
    let server = spawn_default_server().await;
    let client = connect_client(&server).await;

    let response = client
        .request(
            "a2a.joinCoalition",
            serde_json::json!({"coalitionId": "no-such-id"}),
        )
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32004);

    client.disconnect().await;
}

#[tokio::test]
async fn members_are_notified_of_coalition_changes() {
    let server = spawn_default_server().await;
    let client_a = connect_client(&server).await;
    let client_b = connect_client(&server).await;
    let agent_b = client_b.agent_id().await.unwrap();

    let mut updates_a = capture(&client_a, notifications::COALITION_UPDATED);

    let (coalition_id, _) = client_a
        .propose_coalition("Alpha", "market-123", "momentum", 2, 5)
        .await
        .unwrap();
    client_b.join_coalition(&coalition_id).await.unwrap();

    let update = recv_within(&mut updates_a, 3).await;
    assert_eq!(update["event"], "memberJoined");
    assert_eq!(update["agentId"], agent_b.as_str());

    client_a.disconnect().await;
    client_b.disconnect().await;
}

#[tokio::test]
async fn shared_analysis_reaches_market_subscribers() {
    let server = spawn_default_server().await;
    let analyst = connect_client(&server).await;
    let subscriber = connect_client(&server).await;
    let bystander = connect_client(&server).await;

    subscriber.subscribe_market("market-55").await.unwrap();
    let mut seen = capture(&subscriber, notifications::ANALYSIS_SHARED);
    let mut unseen = capture(&bystander, notifications::ANALYSIS_SHARED);

    let analysis_id = analyst
        .share_analysis(AnalysisSubmission {
            market_id: "market-55".to_string(),
            prediction: 0.7,
            confidence: 0.9,
            reasoning: Some("order flow skew".to_string()),
            data_points: None,
        })
        .await
        .unwrap();

    let pushed = recv_within(&mut seen, 3).await;
    assert_eq!(pushed["analysisId"], analysis_id.as_str());
    assert_eq!(pushed["marketId"], "market-55");

    // Non-subscribers see nothing.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(unseen.try_recv().is_err());

    analyst.disconnect().await;
    subscriber.disconnect().await;
    bystander.disconnect().await;
}

#[tokio::test]
async fn payment_request_and_receipt_correlate() {
    let server = spawn_default_server().await;
    let seller = connect_client(&server).await;
    let buyer = connect_client(&server).await;
    let buyer_id = buyer.agent_id().await.unwrap();

    let mut requested = capture(&buyer, notifications::PAYMENT_REQUESTED);
    let mut confirmed = capture(&seller, notifications::PAYMENT_CONFIRMED);

    let request = seller
        .send_payment_request(&buyer_id, dec!(0.10), "analysis")
        .await
        .unwrap();
    assert_eq!(request.to, buyer_id);

    let pushed = recv_within(&mut requested, 3).await;
    assert_eq!(pushed["requestId"], request.request_id.as_str());

    let receipt = buyer
        .send_payment_receipt(&request.request_id, "0xabc123")
        .await
        .unwrap();
    assert!(receipt.confirmed);
    assert_eq!(receipt.request_id, request.request_id);

    let pushed = recv_within(&mut confirmed, 3).await;
    assert_eq!(pushed["txHash"], "0xabc123");

    seller.disconnect().await;
    buyer.disconnect().await;
}

#[tokio::test]
async fn receipt_for_unknown_request_is_rejected() {
    let server = spawn_default_server().await;
    let client = connect_client(&server).await;

    let response = client
        .request(
            "a2a.paymentReceipt",
            serde_json::json!({"requestId": "never-existed", "txHash": "0x0"}),
        )
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32005);

    client.disconnect().await;
}

#[tokio::test]
async fn market_updates_fan_out_to_subscribers() {
    let server = spawn_default_server().await;
    let client_a = connect_client(&server).await;
    let client_b = connect_client(&server).await;

    client_a.subscribe_market("market-777").await.unwrap();
    client_b.subscribe_market("market-777").await.unwrap();
    let mut updates_a = capture(&client_a, notifications::MARKET_UPDATE);
    let mut updates_b = capture(&client_b, notifications::MARKET_UPDATE);

    server.market_data.publish(parley::protocol::messages::MarketUpdate {
        market_id: "market-777".to_string(),
        yes_price: Some(dec!(0.64)),
        no_price: Some(dec!(0.37)),
        volume_24h: Some(dec!(15000)),
        timestamp: chrono::Utc::now(),
    });

    for updates in [&mut updates_a, &mut updates_b] {
        let update = recv_within(updates, 5).await;
        assert_eq!(update["marketId"], "market-777");
        assert_eq!(update["yesPrice"], "0.64");
    }

    client_a.disconnect().await;
    client_b.disconnect().await;
}
