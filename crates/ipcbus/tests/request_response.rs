// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Request/response correlation end to end

mod common;

use common::{eventually, local_worker, start_broker, sync, worker};
use ipcbus::{BusEvent, RequestError, Value};
use std::time::Duration;

fn doubler(event: &BusEvent, args: &[Value]) {
    if let Some(request) = &event.request {
        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
        request.resolve(n * 2);
    }
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn test_request_resolves_with_response() {
    let broker = start_broker().await;
    let client = worker(&broker, "client").await;
    let service = worker(&broker, "service").await;

    service.add_listener("double", doubler);
    sync(&service).await;

    let response = client
        .request("double", 2000, vec![Value::Int(21)])
        .await
        .unwrap();
    assert_eq!(response.value().unwrap(), Value::Int(42));
    assert_eq!(response.sender.id, service.peer().id);
    assert_eq!(response.channel, "double");
    assert_eq!(client.pending_requests(), 0);

    broker.shutdown();
}

#[tokio::test]
async fn test_request_over_local_link() {
    let broker = start_broker().await;
    let client = local_worker(&broker, "client").await;
    let service = worker(&broker, "service").await;

    service.add_listener("double", doubler);
    sync(&service).await;

    let response = client.request("double", 2000, vec![Value::Int(5)]).await.unwrap();
    assert_eq!(response.value().unwrap(), Value::Int(10));

    broker.shutdown();
}

#[tokio::test]
async fn test_rejection_carries_error_value() {
    let broker = start_broker().await;
    let client = worker(&broker, "client").await;
    let service = worker(&broker, "service").await;

    service.add_listener("strict", |event: &BusEvent, _: &[Value]| {
        if let Some(request) = &event.request {
            assert!(request.reject("not allowed"));
            assert!(!request.resolve(1));
        }
    });
    sync(&service).await;

    match client.request("strict", 2000, vec![]).await {
        Err(RequestError::Rejected { sender, err }) => {
            assert_eq!(sender.id, service.peer().id);
            assert_eq!(err, Value::from("not allowed"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    broker.shutdown();
}

#[tokio::test]
async fn test_panicking_listener_rejects_request() {
    let broker = start_broker().await;
    let client = worker(&broker, "client").await;
    let service = worker(&broker, "service").await;

    service.add_listener("fragile", |_: &BusEvent, _: &[Value]| {
        panic!("boom");
    });
    sync(&service).await;

    match client.request("fragile", 2000, vec![]).await {
        Err(RequestError::Rejected { err, .. }) => {
            assert!(err.as_str().unwrap().contains("boom"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    // The service survives its listener.
    assert!(service.is_connected());

    broker.shutdown();
}

#[tokio::test]
async fn test_request_to_targets_one_responder() {
    let broker = start_broker().await;
    let client = worker(&broker, "client").await;
    let first = worker(&broker, "first").await;
    let second = worker(&broker, "second").await;

    for service in [&first, &second] {
        let name = service.peer().name.clone().unwrap_or_default();
        service.add_listener("who", move |event: &BusEvent, _: &[Value]| {
            if let Some(request) = &event.request {
                request.resolve(name.as_str());
            }
        });
        sync(service).await;
    }

    for _ in 0..5 {
        let response = client
            .request_to(second.peer(), "who", 2000, vec![])
            .await
            .unwrap();
        assert_eq!(response.value().unwrap(), Value::from("second"));
    }

    broker.shutdown();
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn test_request_without_responder_times_out() {
    let broker = start_broker().await;
    let client = worker(&broker, "client").await;

    let err = client.request("void", 100, vec![]).await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(client.pending_requests(), 0);

    broker.shutdown();
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let broker = start_broker().await;
    let client = worker(&broker, "client").await;
    let service = worker(&broker, "service").await;

    // Never answers.
    service.add_listener("slow", |_: &BusEvent, _: &[Value]| {});
    sync(&service).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", -1, vec![]).await })
    };
    eventually("request registered", || client.pending_requests() == 1).await;

    client.close().await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(RequestError::Closed)));
    assert!(!client.is_connected());

    broker.shutdown();
}

#[tokio::test]
async fn test_request_when_not_connected() {
    let broker = start_broker().await;
    let client = worker(&broker, "client").await;
    client.close().await;

    let err = client.request("any", 100, vec![]).await.unwrap_err();
    assert!(matches!(err, RequestError::NotConnected));
    assert!(!client.send("any", vec![]));

    broker.shutdown();
}
