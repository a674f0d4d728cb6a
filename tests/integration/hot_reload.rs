//! Hot reload: growing a pool's route set without dropping traffic

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rust_balancer::{LoadBalancer, PoolRoute};

use super::harness::{
    free_port, send_request, test_options, unlimited_quota, wait_until_serving, TestPki,
    TestUpstream,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_grows_the_pool_without_failures() {
    let pki = TestPki::generate();
    let server1 = TestUpstream::spawn("Server 1 responded").await;
    let server2 = TestUpstream::spawn("Server 2 responded").await;
    let server3 = TestUpstream::spawn("Server 3 responded").await;

    let port = free_port().await;
    let base_pool = pki
        .pool("test", port)
        .with_rate_quota(unlimited_quota());
    let pool = base_pool
        .clone()
        .with_route(server1.addr.to_string());

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

    let mut routes = vec![PoolRoute::new(server1.addr.to_string())];
    let mut tasks = Vec::new();
    for i in 0..100u32 {
        if i % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Grow the pool mid-traffic at request 20 and request 40
        if i == 20 {
            routes.push(PoolRoute::new(server2.addr.to_string()));
            balancer
                .update_pool(base_pool.clone().with_routes(routes.clone()))
                .unwrap();
        }
        if i == 40 {
            routes.push(PoolRoute::new(server3.addr.to_string()));
            balancer
                .update_pool(base_pool.clone().with_routes(routes.clone()))
                .unwrap();
        }

        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(
            async move { send_request(port, &client).await },
        ));
    }

    let mut responded = [0usize; 3];
    for task in tasks {
        let response = task
            .await
            .unwrap()
            .expect("request failed during hot reload");
        if response.contains('1') {
            responded[0] += 1;
        } else if response.contains('2') {
            responded[1] += 1;
        } else if response.contains('3') {
            responded[2] += 1;
        }
    }

    assert!(
        responded.iter().all(|&n| n > 0),
        "an added server never received traffic: {responded:?}"
    );

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), serving).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_can_drain_a_route() {
    let pki = TestPki::generate();
    let keep = TestUpstream::spawn("keep").await;
    let drain = TestUpstream::spawn("drain").await;

    let port = free_port().await;
    let base_pool = pki
        .pool("test", port)
        .with_rate_quota(unlimited_quota());
    let pool = base_pool
        .clone()
        .with_route(keep.addr.to_string())
        .with_route(drain.addr.to_string());

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

    // Drop the second route from the descriptor
    balancer
        .update_pool(
            base_pool
                .clone()
                .with_routes(vec![PoolRoute::new(keep.addr.to_string())]),
        )
        .unwrap();

    let drained_before = drain.hit_count();
    for _ in 0..10 {
        let response = send_request(port, &client).await.unwrap();
        assert_eq!(response, "keep");
    }
    assert_eq!(drain.hit_count(), drained_before);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), serving).await;
}
