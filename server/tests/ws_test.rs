//! Integration tests for the socket handshake, identity faults, presence and
//! the accept race as seen by connected clients.

mod common;

use common::*;
use futures_util::SinkExt;
use rideshare_server::auth::Role;
use serde_json::json;
use std::time::Duration;

const EXPIRY: Duration = Duration::from_secs(120);

#[tokio::test]
async fn test_invalid_token_closes_with_4002() {
    let server = start_test_server(EXPIRY).await;
    let url = format!("{}?token=not-a-jwt", server.ws_url);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    assert_eq!(recv_close_code(&mut ws).await, Some(4002));
}

#[tokio::test]
async fn test_missing_token_closes_with_4002() {
    let server = start_test_server(EXPIRY).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&server.ws_url).await.unwrap();
    assert_eq!(recv_close_code(&mut ws).await, Some(4002));
}

#[tokio::test]
async fn test_connected_is_first_frame() {
    let server = start_test_server(EXPIRY).await;
    let url = format!("{}?token={}", server.ws_url, server.token("d1", Role::Driver));
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let first = next_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    assert_eq!(first["event"], "connected");
    assert_eq!(first["data"]["userId"], "d1");
    assert_eq!(first["data"]["role"], "driver");
    assert!(first["data"]["connectionId"].as_str().is_some());
}

#[tokio::test]
async fn test_user_connected_mismatch_closes_with_4002() {
    let server = start_test_server(EXPIRY).await;
    let mut ws = server.ws("p1", Role::User).await;

    send_json(
        &mut ws,
        json!({"event": "user_connected", "data": {"userId": "someone-else", "role": "user"}}),
    )
    .await;
    assert_eq!(recv_close_code(&mut ws).await, Some(4002));
}

#[tokio::test]
async fn test_user_connected_match_keeps_connection() {
    let server = start_test_server(EXPIRY).await;
    let mut ws = server.ws("p1", Role::User).await;

    send_json(
        &mut ws,
        json!({"event": "user_connected", "data": {"userId": "p1", "role": "user"}}),
    )
    .await;
    send_json(&mut ws, json!({"event": "presence_resync"})).await;
    let update = recv_event(&mut ws, "active_users_update").await;
    assert_eq!(update["data"]["user"], 1);
}

#[tokio::test]
async fn test_invalid_frame_gets_error_event() {
    let server = start_test_server(EXPIRY).await;
    let mut ws = server.ws("p1", Role::User).await;

    send_json(&mut ws, json!({"event": "teleport", "data": {}})).await;
    let err = recv_event(&mut ws, "error").await;
    assert_eq!(err["data"]["code"], 400);
}

#[tokio::test]
async fn test_three_drivers_then_one_leaves() {
    let server = start_test_server(EXPIRY).await;
    // Presence goes to admins, so the observer is counted in `total` as well
    let mut admin = server.ws("a1", Role::Admin).await;

    let update = recv_event(&mut admin, "active_users_update").await;
    assert_eq!(update["data"], json!({"total": 1, "driver": 0, "user": 0, "admin": 1}));

    let mut d1 = server.ws("d1", Role::Driver).await;
    let update = recv_event(&mut admin, "active_users_update").await;
    assert_eq!(update["data"]["driver"], 1);

    let _d2 = server.ws("d2", Role::Driver).await;
    let update = recv_event(&mut admin, "active_users_update").await;
    assert_eq!(update["data"]["driver"], 2);

    let _d3 = server.ws("d3", Role::Driver).await;
    let update = recv_event(&mut admin, "active_users_update").await;
    assert_eq!(update["data"]["driver"], 3);
    assert_eq!(update["data"]["total"], 4);

    d1.close(None).await.unwrap();
    let update = recv_event(&mut admin, "active_users_update").await;
    assert_eq!(update["data"]["driver"], 2);
    assert_eq!(update["data"]["user"], 0);
    assert_eq!(update["data"]["admin"], 1);
    assert_eq!(update["data"]["total"], 3);
}

#[tokio::test]
async fn test_driver_disconnect_announces_unavailability() {
    let server = start_test_server(EXPIRY).await;
    let mut admin = server.ws("a1", Role::Admin).await;
    let mut d1 = server.ws("d1", Role::Driver).await;

    let online = recv_event(&mut admin, "driver_availability_update").await;
    assert_eq!(online["data"]["driverId"], "d1");
    assert_eq!(online["data"]["available"], true);

    d1.close(None).await.unwrap();
    let offline = recv_event(&mut admin, "driver_availability_update").await;
    assert_eq!(offline["data"]["available"], false);
}

#[tokio::test]
async fn test_two_drivers_exactly_one_wins() {
    let server = start_test_server(EXPIRY).await;
    let mut passenger = server.ws("p1", Role::User).await;
    let mut d1 = server.ws("d1", Role::Driver).await;
    let mut d2 = server.ws("d2", Role::Driver).await;

    assert_eq!(server.open_ride("p1", "R1").await.status(), 201);
    recv_event(&mut d1, "new_ride_request").await;
    recv_event(&mut d2, "new_ride_request").await;

    send_json(&mut d1, accept_frame("req-1", "R1", "d1", "p1")).await;
    send_json(&mut d2, accept_frame("req-2", "R1", "d2", "p1")).await;

    let d1_frames = collect_all(&mut d1, Duration::from_millis(1500)).await;
    let d2_frames = collect_all(&mut d2, Duration::from_millis(1500)).await;

    let acks: Vec<_> = of_event(&d1_frames, "ride_accepted_ack")
        .into_iter()
        .chain(of_event(&d2_frames, "ride_accepted_ack"))
        .collect();
    assert_eq!(acks.len(), 2);
    let winners: Vec<_> = acks.iter().filter(|a| a["data"]["success"] == true).collect();
    assert_eq!(winners.len(), 1, "exactly one accept must succeed: {:?}", acks);

    let (loser_frames, winner_id) = if winners[0]["data"]["requestId"] == "req-1" {
        (&d2_frames, "d1")
    } else {
        (&d1_frames, "d2")
    };
    let unavailable = of_event(loser_frames, "notification")
        .into_iter()
        .filter(|n| n["data"]["type"] == "ride_unavailable")
        .count();
    assert_eq!(unavailable, 1, "the losing driver is told the ride is gone");

    let statuses = collect_events(&mut passenger, "ride_status_changed", Duration::from_millis(1000)).await;
    assert_eq!(statuses.len(), 1, "passenger hears about the acceptance once");
    assert_eq!(statuses[0]["data"]["status"], "accepted");

    let (status, body) = server
        .get("/api/rides/R1", &server.token("p1", Role::User))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "accepted");
    assert_eq!(body["data"]["winningDriverId"], winner_id);
}

#[tokio::test]
async fn test_accept_with_foreign_driver_id_is_refused() {
    let server = start_test_server(EXPIRY).await;
    let mut d1 = server.ws("d1", Role::Driver).await;
    server.open_ride("p1", "R1").await;

    send_json(&mut d1, accept_frame("req-1", "R1", "d2", "p1")).await;
    let ack = recv_event(&mut d1, "ride_accepted_ack").await;
    assert_eq!(ack["data"]["success"], false);

    let (_, body) = server
        .get("/api/rides/R1", &server.token("d1", Role::Driver))
        .await;
    assert_eq!(body["data"]["status"], "pending");
}

#[tokio::test]
async fn test_join_room_requires_participation() {
    let server = start_test_server(EXPIRY).await;
    let mut passenger = server.ws("p1", Role::User).await;
    let mut stranger = server.ws("p2", Role::User).await;
    server.open_ride("p1", "R1").await;

    send_json(&mut passenger, json!({"event": "join_room", "data": {"room": "ride:R1"}})).await;
    let joined = recv_event(&mut passenger, "room_joined").await;
    assert_eq!(joined["data"]["room"], "ride:R1");

    send_json(&mut stranger, json!({"event": "join_room", "data": {"room": "ride:R1"}})).await;
    let err = recv_event(&mut stranger, "error").await;
    assert_eq!(err["data"]["code"], 403);

    send_json(&mut stranger, json!({"event": "join_room", "data": {"room": "role:admin"}})).await;
    let err = recv_event(&mut stranger, "error").await;
    assert_eq!(err["data"]["code"], 403);
}

#[tokio::test]
async fn test_status_updates_reach_ride_room() {
    let server = start_test_server(EXPIRY).await;
    let mut passenger = server.ws("p1", Role::User).await;
    let mut d1 = server.ws("d1", Role::Driver).await;
    server.open_ride("p1", "R1").await;

    send_json(&mut d1, accept_frame("req-1", "R1", "d1", "p1")).await;
    let ack = recv_event(&mut d1, "ride_accepted_ack").await;
    assert_eq!(ack["data"]["success"], true);
    recv_event(&mut passenger, "ride_status_changed").await;

    let (status, _) = server
        .post(
            "/api/rides/R1/status",
            &server.token("d1", Role::Driver),
            json!({"status": "arrived"}),
        )
        .await;
    assert_eq!(status, 200);

    let arrived = recv_event(&mut passenger, "ride_status_changed").await;
    assert_eq!(arrived["data"]["status"], "arrived");
    let echoed = recv_event(&mut d1, "ride_status_changed").await;
    assert_eq!(echoed["data"]["status"], "arrived");
}
