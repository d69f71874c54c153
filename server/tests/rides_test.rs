//! Integration tests for ride claims: concurrent acceptance, expiry and cancellation.

mod common;

use common::*;
use rideshare_server::auth::Role;
use serde_json::json;
use std::time::Duration;

const EXPIRY: Duration = Duration::from_secs(120);

#[tokio::test]
async fn test_many_concurrent_accepts_single_winner() {
    const DRIVERS: usize = 6;
    let server = start_test_server(EXPIRY).await;

    let mut sockets = Vec::new();
    for i in 0..DRIVERS {
        sockets.push(server.ws(&format!("d{}", i), Role::Driver).await);
    }
    assert_eq!(server.open_ride("p1", "R1").await.status(), 201);

    for (i, ws) in sockets.iter_mut().enumerate() {
        let driver = format!("d{}", i);
        send_json(ws, accept_frame(&format!("req-{}", i), "R1", &driver, "p1")).await;
    }

    let mut handles = Vec::new();
    for mut ws in sockets {
        handles.push(tokio::spawn(async move {
            recv_event(&mut ws, "ride_accepted_ack").await
        }));
    }
    let mut successes = Vec::new();
    for handle in handles {
        let ack = handle.await.unwrap();
        if ack["data"]["success"] == true {
            successes.push(ack["data"]["requestId"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(successes.len(), 1, "winners: {:?}", successes);

    let winner = successes[0].replace("req-", "d");
    let (_, body) = server
        .get("/api/rides/R1", &server.token("p1", Role::User))
        .await;
    assert_eq!(body["data"]["winningDriverId"], winner.as_str());
}

#[tokio::test]
async fn test_duplicate_ride_id_conflicts() {
    let server = start_test_server(EXPIRY).await;
    assert_eq!(server.open_ride("p1", "R1").await.status(), 201);
    assert_eq!(server.open_ride("p1", "R1").await.status(), 409);
}

#[tokio::test]
async fn test_only_passengers_open_rides() {
    let server = start_test_server(EXPIRY).await;
    let (status, _) = server
        .post(
            "/api/rides",
            &server.token("d1", Role::Driver),
            json!({"rideId": "R1", "pickupLocationName": "A", "dropoffLocationName": "B"}),
        )
        .await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_expired_ride_cannot_be_accepted() {
    let server = start_test_server(Duration::from_secs(1)).await;
    let mut passenger = server.ws("p1", Role::User).await;
    let mut driver = server.ws("d1", Role::Driver).await;
    server.open_ride("p1", "R1").await;

    let expired = recv_event(&mut passenger, "ride_status_changed").await;
    assert_eq!(expired["data"]["status"], "expired");

    send_json(&mut driver, accept_frame("req-1", "R1", "d1", "p1")).await;
    let ack = recv_event(&mut driver, "ride_accepted_ack").await;
    assert_eq!(ack["data"]["success"], false);

    let (_, body) = server
        .get("/api/rides/R1", &server.token("p1", Role::User))
        .await;
    assert_eq!(body["data"]["status"], "expired");
    assert!(body["data"]["winningDriverId"].is_null());
}

#[tokio::test]
async fn test_canceled_ride_cannot_be_accepted() {
    let server = start_test_server(EXPIRY).await;
    let mut driver = server.ws("d1", Role::Driver).await;
    server.open_ride("p1", "R1").await;

    let (status, _) = server
        .post("/api/rides/R1/cancel", &server.token("p2", Role::User), json!({}))
        .await;
    assert_eq!(status, 403);

    let (status, body) = server
        .post("/api/rides/R1/cancel", &server.token("p1", Role::User), json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "canceled");

    send_json(&mut driver, accept_frame("req-1", "R1", "d1", "p1")).await;
    let ack = recv_event(&mut driver, "ride_accepted_ack").await;
    assert_eq!(ack["data"]["success"], false);
    assert_eq!(ack["data"]["message"], "Ride was canceled");
}

#[tokio::test]
async fn test_unknown_ride_is_not_found() {
    let server = start_test_server(EXPIRY).await;
    let (status, _) = server
        .get("/api/rides/nope", &server.token("a1", Role::Admin))
        .await;
    assert_eq!(status, 404);

    let mut driver = server.ws("d1", Role::Driver).await;
    send_json(&mut driver, accept_frame("req-1", "nope", "d1", "p1")).await;
    let ack = recv_event(&mut driver, "ride_accepted_ack").await;
    assert_eq!(ack["data"]["success"], false);
    assert_eq!(ack["data"]["message"], "Ride not found");
}

#[tokio::test]
async fn test_only_the_winner_reports_status() {
    let server = start_test_server(EXPIRY).await;
    let mut d1 = server.ws("d1", Role::Driver).await;
    server.open_ride("p1", "R1").await;
    send_json(&mut d1, accept_frame("req-1", "R1", "d1", "p1")).await;
    recv_event(&mut d1, "ride_accepted_ack").await;

    let (status, _) = server
        .post(
            "/api/rides/R1/status",
            &server.token("d2", Role::Driver),
            json!({"status": "arrived"}),
        )
        .await;
    assert_eq!(status, 403);

    let (status, _) = server
        .post(
            "/api/rides/R1/status",
            &server.token("d1", Role::Driver),
            json!({"status": "accepted"}),
        )
        .await;
    assert_eq!(status, 409);
}
