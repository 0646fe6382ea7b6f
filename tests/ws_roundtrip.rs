mod common;

use std::time::Duration;

use common::{eventually, record, start_server, WAIT};
use serde_json::json;
use tokio::time::sleep;
use ws_value::transport::{get_method, set_method, set_params};
use ws_value::{ClientConfig, Error, RpcClient, SyncedValue};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn procedures_roundtrip() {
    let (server, handle) = start_server().await;
    let authority = SyncedValue::<u32>::authority(server.clone(), "foo");

    let client = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .expect("connect");

    assert_eq!(client.request(&get_method("foo"), None).await.unwrap(), json!(null));

    let answer = client
        .request(&set_method("foo"), Some(set_params(json!(5))))
        .await
        .unwrap();
    assert_eq!(answer, json!(null));
    assert_eq!(authority.get_value(), Some(5));
    assert_eq!(client.request(&get_method("foo"), None).await.unwrap(), json!(5));

    let err = client
        .request(&set_method("foo"), Some(set_params(json!("five"))))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { code: -32602, .. }), "{:?}", err);
    assert_eq!(authority.get_value(), Some(5));

    let err = client.request("get-bar", None).await.unwrap_err();
    assert!(matches!(err, Error::Remote { code: -32601, .. }), "{:?}", err);

    client.close();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirror_starts_absent_until_fetched() {
    let (server, handle) = start_server().await;
    let authority = SyncedValue::<u32>::authority(server.clone(), "foo");
    authority.set_value(42).unwrap();

    let client = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let mirror = SyncedValue::<u32>::mirror(client.clone(), "foo");
    assert_eq!(mirror.get_value(), None);
    assert!(!mirror.is_initialized());

    assert!(eventually(WAIT, || mirror.get_value() == Some(42)).await);
    assert!(mirror.is_initialized());

    client.close();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authority_dedups_repeated_value() {
    let (server, handle) = start_server().await;
    let authority = SyncedValue::<u32>::authority(server.clone(), "foo");

    let client = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let mirror = SyncedValue::<u32>::mirror(client.clone(), "foo");
    let seen = record(&mirror);

    // the initial fetch of an absent value
    assert!(eventually(WAIT, || seen.lock().len() == 1).await);
    assert_eq!(server.subscriber_count("foo"), 1);

    authority.set_value(666).unwrap();
    assert!(eventually(WAIT, || seen.lock().len() == 2).await);
    assert_eq!(*seen.lock(), vec![None, Some(666)]);

    authority.set_value(666).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(*seen.lock(), vec![None, Some(666)]);

    client.close();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_reaches_mirror_as_absent() {
    let (server, handle) = start_server().await;
    let authority = SyncedValue::<u32>::authority(server.clone(), "foo");

    let client = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let mirror = SyncedValue::<u32>::mirror(client.clone(), "foo");
    let seen = record(&mirror);
    assert!(eventually(WAIT, || seen.lock().len() == 1).await);

    authority.set_value(123).unwrap();
    authority.reset_value().unwrap();

    assert!(eventually(WAIT, || seen.lock().len() == 3).await);
    assert_eq!(*seen.lock(), vec![None, Some(123), None]);
    assert_eq!(mirror.get_value(), None);
    assert!(mirror.is_initialized());

    client.close();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirror_write_goes_through_authority() {
    let (server, handle) = start_server().await;
    let authority = SyncedValue::<u32>::authority(server.clone(), "foo");
    let authority_seen = record(&authority);

    let client = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let mirror = SyncedValue::<u32>::mirror(client.clone(), "foo");
    let seen = record(&mirror);
    assert!(eventually(WAIT, || seen.lock().len() == 1).await);

    mirror.set_value(777).unwrap();
    // a mirror never moves on its own write
    assert_eq!(mirror.get_value(), None);

    assert!(eventually(WAIT, || mirror.get_value() == Some(777)).await);
    assert_eq!(authority.get_value(), Some(777));
    assert_eq!(*authority_seen.lock(), vec![Some(777)]);

    client.close();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_reaches_every_mirror() {
    let (server, handle) = start_server().await;
    let authority = SyncedValue::<String>::authority(server.clone(), "greeting");

    let first = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let second = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let a = SyncedValue::<String>::mirror(first.clone(), "greeting");
    let b = SyncedValue::<String>::mirror(second.clone(), "greeting");
    let seen_a = record(&a);
    let seen_b = record(&b);
    assert!(eventually(WAIT, || seen_a.lock().len() == 1 && seen_b.lock().len() == 1).await);

    b.set_value("hello".to_string()).unwrap();

    let expected = Some("hello".to_string());
    assert!(eventually(WAIT, || a.get_value() == expected && b.get_value() == expected).await);
    assert_eq!(authority.get_value(), expected);
    assert_eq!(server.subscriber_count("greeting"), 2);

    first.close();
    second.close();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mirror_writers_converge() {
    let (server, handle) = start_server().await;
    let authority = SyncedValue::<u32>::authority(server.clone(), "foo");
    authority.on_change(|_| std::thread::sleep(Duration::from_millis(1)));

    let first = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let second = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();
    let a = SyncedValue::<u32>::mirror(first.clone(), "foo");
    let b = SyncedValue::<u32>::mirror(second.clone(), "foo");
    assert!(eventually(WAIT, || server.subscriber_count("foo") == 2).await);

    for n in 0..50 {
        a.set_value(n).unwrap();
        b.set_value(1000 + n).unwrap();
    }

    let settled = || {
        let current = authority.get_value();
        current.is_some() && a.get_value() == current && b.get_value() == current
    };
    assert!(eventually(WAIT, settled).await);
    sleep(Duration::from_millis(200)).await;
    assert!(settled());

    first.close();
    second.close();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribed_event_is_refused() {
    let (_server, handle) = start_server().await;
    let client = RpcClient::connect(&handle.url(), ClientConfig::default())
        .await
        .unwrap();

    let answer = client
        .request("rpc.on", Some(json!(["nobody-declared-this"])))
        .await
        .unwrap();
    assert_eq!(answer, json!({ "nobody-declared-this": "provided event invalid" }));

    client.close();
    handle.shutdown().await;
}
