//! WebInspector state machine against a stub inspector daemon

#[macro_use]
mod common;

use std::{sync::Arc, time::Duration};

use muxdev::{web_inspector::WebInspector, DeviceConnection, MuxdevError};
use tokio::net::{TcpListener, TcpStream};

use common::{read_plist_frame, write_plist_frame};

const SAFARI: &str = "com.apple.mobilesafari";
const APP_ID: &str = "PID:100";

fn selector_msg(selector: &str, argument: plist::Dictionary) -> plist::Dictionary {
    let mut msg = dict! {"__selector" => selector};
    msg.insert("__argument".into(), plist::Value::Dictionary(argument));
    msg
}

fn safari_entry(ready: bool) -> plist::Dictionary {
    dict! {
        "WIRApplicationIdentifierKey" => APP_ID,
        "WIRApplicationBundleIdentifierKey" => SAFARI,
        "WIRIsApplicationReadyKey" => ready,
    }
}

async fn read_selector(sock: &mut TcpStream) -> (String, plist::Dictionary) {
    let msg = read_plist_frame(sock).await;
    let selector = msg
        .get("__selector")
        .and_then(|x| x.as_string())
        .expect("message must carry a selector")
        .to_owned();
    let argument = msg
        .get("__argument")
        .and_then(|x| x.as_dictionary())
        .cloned()
        .unwrap_or_default();
    (selector, argument)
}

fn automation_page(session: &str, confirmed: bool) -> plist::Dictionary {
    let mut page = dict! {
        "WIRTypeKey" => "WIRTypeAutomation",
        "WIRPageIdentifierKey" => 1u64,
        "WIRSessionIdentifierKey" => session,
    };
    if confirmed {
        page.insert("WIRConnectionIdentifierKey".into(), session.into());
    }
    page
}

fn listing_msg(session: &str, confirmed: bool) -> plist::Dictionary {
    let mut listing = plist::Dictionary::new();
    listing.insert(
        "1".into(),
        plist::Value::Dictionary(automation_page(session, confirmed)),
    );
    let mut argument = dict! {"WIRApplicationIdentifierKey" => APP_ID};
    argument.insert("WIRListingKey".into(), plist::Value::Dictionary(listing));
    selector_msg("_rpc_applicationSentListing:", argument)
}

/// Walks a client through the full handshake, then answers `count`
/// automation requests
async fn serve_session(listener: TcpListener, count: usize) {
    let (mut sock, _) = listener.accept().await.unwrap();

    let (selector, argument) = read_selector(&mut sock).await;
    assert_eq!(selector, "_rpc_reportIdentifier:");
    let session = argument
        .get("WIRConnectionIdentifierKey")
        .and_then(|x| x.as_string())
        .expect("client must identify its connection")
        .to_owned();
    assert_eq!(session, session.to_uppercase(), "session id is uppercase");

    write_plist_frame(
        &mut sock,
        &selector_msg(
            "_rpc_reportCurrentState:",
            dict! {"WIRAutomationAvailabilityKey" => "WIRAutomationAvailabilityAvailable"},
        ),
    )
    .await;

    let mut apps = plist::Dictionary::new();
    apps.insert(APP_ID.into(), plist::Value::Dictionary(safari_entry(false)));
    let mut argument = plist::Dictionary::new();
    argument.insert("WIRApplicationDictionaryKey".into(), plist::Value::Dictionary(apps));
    write_plist_frame(
        &mut sock,
        &selector_msg("_rpc_reportConnectedApplicationList:", argument),
    )
    .await;

    write_plist_frame(
        &mut sock,
        &selector_msg("_rpc_applicationUpdated:", safari_entry(true)),
    )
    .await;

    let (selector, argument) = read_selector(&mut sock).await;
    assert_eq!(selector, "_rpc_forwardAutomationSessionRequest:");
    assert_eq!(
        argument
            .get("WIRSessionIdentifierKey")
            .and_then(|x| x.as_string()),
        Some(session.as_str())
    );
    let capabilities = argument
        .get("WIRSessionCapabilitiesKey")
        .and_then(|x| x.as_dictionary())
        .expect("session request carries capabilities");
    assert_eq!(
        capabilities
            .get("WIRAllowInsecureMediaCaptureCapabilityKey")
            .and_then(|x| x.as_boolean()),
        Some(true)
    );

    write_plist_frame(&mut sock, &listing_msg(&session, false)).await;

    let (selector, argument) = read_selector(&mut sock).await;
    assert_eq!(selector, "_rpc_forwardSocketSetup:");
    assert_eq!(
        argument
            .get("WIRPageIdentifierKey")
            .and_then(|x| x.as_unsigned_integer()),
        Some(1)
    );

    write_plist_frame(&mut sock, &listing_msg(&session, true)).await;

    for _ in 0..count {
        let (selector, argument) = read_selector(&mut sock).await;
        assert_eq!(selector, "_rpc_forwardSocketData:");
        let data = argument
            .get("WIRSocketDataKey")
            .and_then(|x| x.as_data())
            .expect("socket data rides as a data blob");
        let request: serde_json::Value = serde_json::from_slice(data).unwrap();
        let id = request["id"].as_u64().unwrap();

        let result = match request["method"].as_str().unwrap() {
            "Automation.createBrowsingContext" => serde_json::json!({"handle": "page-1"}),
            "Automation.getBrowsingContexts" => serde_json::json!({
                "contexts": [{"handle": "page-1", "url": "about:blank", "active": true}]
            }),
            "Automation.navigateBrowsingContext" => serde_json::json!({}),
            other => panic!("stub got unexpected method {other}"),
        };
        let reply = serde_json::json!({"id": id, "result": result});

        let mut argument = dict! {"WIRDestinationKey" => session.as_str()};
        argument.insert(
            "WIRMessageDataKey".into(),
            plist::Value::Data(serde_json::to_vec(&reply).unwrap()),
        );
        write_plist_frame(
            &mut sock,
            &selector_msg("_rpc_applicationSentData:", argument),
        )
        .await;
    }

    // Stay up until the client is done
    let mut buf = [0u8; 1];
    let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
}

async fn inspector(addr: std::net::SocketAddr, timeout: Duration) -> WebInspector {
    let sock = TcpStream::connect(addr).await.unwrap();
    WebInspector::start(DeviceConnection::new(Box::new(sock), "wi-test"), timeout).unwrap()
}

#[tokio::test]
async fn connects_and_creates_a_page() {
    let (listener, addr) = common::listener().await;
    let stub = tokio::spawn(serve_session(listener, 3));

    let inspector = Arc::new(inspector(addr, Duration::from_secs(5)).await);

    // Issued before the session connects: parked, then replayed
    let early = {
        let inspector = Arc::clone(&inspector);
        tokio::spawn(async move { inspector.create_page().await })
    };

    inspector
        .wait_for_session(Duration::from_secs(5))
        .await
        .unwrap();

    let handle = early.await.unwrap().unwrap();
    assert_eq!(handle, "page-1");

    let pages = inspector.list_pages().await.unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].id, "page-1");
    assert!(pages[0].active);

    inspector
        .navigate("page-1", "https://example.com", None)
        .await
        .unwrap();

    drop(inspector);
    stub.await.unwrap();
}

#[tokio::test]
async fn refuses_when_automation_is_unavailable() {
    let (listener, addr) = common::listener().await;
    let stub = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let (selector, _) = read_selector(&mut sock).await;
        assert_eq!(selector, "_rpc_reportIdentifier:");
        write_plist_frame(
            &mut sock,
            &selector_msg(
                "_rpc_reportCurrentState:",
                dict! {"WIRAutomationAvailabilityKey" => "WIRAutomationAvailabilityNotAvailable"},
            ),
        )
        .await;
        let mut buf = [0u8; 1];
        let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
    });

    let inspector = inspector(addr, Duration::from_secs(5)).await;
    match inspector.wait_for_session(Duration::from_secs(5)).await {
        Err(MuxdevError::NoAutomation) => {}
        other => panic!("expected NoAutomation, got {other:?}"),
    }
    // The failure is sticky
    match inspector.create_page().await {
        Err(MuxdevError::NoAutomation) => {}
        other => panic!("expected NoAutomation, got {other:?}"),
    }

    drop(inspector);
    stub.await.unwrap();
}

#[tokio::test]
async fn start_timeout_parks_the_session_in_failed() {
    let (listener, addr) = common::listener().await;
    let stub = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let (selector, _) = read_selector(&mut sock).await;
        assert_eq!(selector, "_rpc_reportIdentifier:");
        // Say nothing more; the client must give up on its own
        let mut buf = [0u8; 1];
        let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
    });

    let inspector = inspector(addr, Duration::from_millis(200)).await;
    match inspector.wait_for_session(Duration::from_secs(5)).await {
        Err(MuxdevError::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
    match inspector.list_pages().await {
        Err(MuxdevError::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }

    drop(inspector);
    stub.await.unwrap();
}
