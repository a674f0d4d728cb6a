//! Quarantine and recovery of failed upstreams

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rust_balancer::LoadBalancer;

use super::harness::{
    free_port, send_request, test_options, unlimited_quota, wait_until_serving, TestPki,
    TestUpstream,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routes_recover_after_upstreams_restart() {
    let pki = TestPki::generate();
    let server1 = TestUpstream::spawn("Server 1 back").await;
    let server2 = TestUpstream::spawn("Server 2 back").await;

    let port = free_port().await;
    let pool = pki
        .pool("test", port)
        .with_route(server1.addr.to_string())
        .with_route(server2.addr.to_string())
        .with_rate_quota(unlimited_quota())
        // One successful probe at a one-second cadence reinstates a route
        .with_health_check(1, 1000);

    let shutdown = CancellationToken::new();
    let balancer = Arc::new(
        LoadBalancer::new(shutdown.clone(), vec![pool], test_options()).unwrap(),
    );
    let serving = {
        let balancer = Arc::clone(&balancer);
        tokio::spawn(async move { balancer.listen().await })
    };

    let client = super::harness::client_config(&pki, Some(&pki.client_identity("test")));
    wait_until_serving(port, &client).await.unwrap();

    // Warm traffic against both upstreams
    for _ in 0..10 {
        send_request(port, &client).await.expect("warmup request");
    }

    // Take both upstreams down; the next dials quarantine both routes
    let port1 = server1.stop();
    let port2 = server2.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    for _ in 0..4 {
        let _ = send_request(port, &client).await;
    }

    // With every route unhealthy nothing is forwarded
    assert!(send_request(port, &client).await.is_err());

    // Bring both back on the same ports; probes reinstate them
    let restarted1 = TestUpstream::spawn_on(port1, "Server 1 back").await;
    let restarted2 = TestUpstream::spawn_on(port2, "Server 2 back").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let mut recovered = false;
    while tokio::time::Instant::now() < deadline {
        if send_request(port, &client).await.is_ok() {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert!(recovered, "no route was reinstated after restart");

    // Keep sending until both restarted upstreams have answered
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while (restarted1.hit_count() == 0 || restarted2.hit_count() == 0)
        && tokio::time::Instant::now() < deadline
    {
        let _ = send_request(port, &client).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        restarted1.hit_count() > 0,
        "first upstream saw no traffic after restart"
    );
    assert!(
        restarted2.hit_count() > 0,
        "second upstream saw no traffic after restart"
    );

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), serving).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn surviving_route_keeps_serving_while_other_is_down() {
    let pki = TestPki::generate();
    let stable = TestUpstream::spawn("stable").await;
    let flaky = TestUpstream::spawn("flaky").await;

    let port = free_port().await;
    let pool = pki
        .pool("test", port)
        .with_route(stable.addr.to_string())
        .with_route(flaky.addr.to_string())
        .with_rate_quota(unlimited_quota())
        .with_health_check(2, 1000);

    let shutdown = CancellationToken::new();
    let balancer = Arc::new(
        LoadBalancer::new(shutdown.clone(), vec![pool], test_options()).unwrap(),
    );
    let serving = {
        let balancer = Arc::clone(&balancer);
        tokio::spawn(async move { balancer.listen().await })
    };

    let client = super::harness::client_config(&pki, Some(&pki.client_identity("test")));
    wait_until_serving(port, &client).await.unwrap();

    let _ = flaky.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The first dials may hit the dead route and quarantine it; after that
    // every request lands on the survivor
    let mut consecutive = 0;
    for _ in 0..20 {
        match send_request(port, &client).await {
            Ok(response) => {
                assert_eq!(response, "stable");
                consecutive += 1;
                if consecutive >= 5 {
                    break;
                }
            }
            Err(_) => consecutive = 0,
        }
    }
    assert!(
        consecutive >= 5,
        "the healthy route did not absorb the traffic"
    );

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), serving).await;
}
