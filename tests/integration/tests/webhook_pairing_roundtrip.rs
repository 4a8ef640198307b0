use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use httpmock::prelude::*;
use mpgate_access::{
    AccessStorePaths, AiAssistantStore, FileAllowList, MenuPayloadStore, PairingResolver,
    PairingResolverConfig,
};
use mpgate_channel::{
    compute_signature, ChannelAccountConfig, ChannelApiClient, ChannelPipeline,
    HttpAgentDispatcher, PipelineDependencies, UnpairedPolicy,
};
use mpgate_core::FileLockPolicy;
use mpgate_gateway::{serve_gateway, GatewayServerConfig, GatewayServerState};
use mpgate_runtime::{SafeFetchConfig, SafeFetcher, SsrfProtectionConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const PAIRING_TOKEN: &str = "operator-pairing-token";
const WEBHOOK_TOKEN: &str = "webhook-token";

struct RunningGateway {
    addr: SocketAddr,
    state_dir: PathBuf,
    client: reqwest::Client,
}

fn local_fetcher() -> Arc<SafeFetcher> {
    Arc::new(
        SafeFetcher::new(SafeFetchConfig {
            ssrf: SsrfProtectionConfig {
                allow_private_network: true,
                ..SsrfProtectionConfig::default()
            },
            ..SafeFetchConfig::default()
        })
        .expect("fetcher"),
    )
}

async fn start_gateway(state_dir: &Path, provider: &MockServer) -> RunningGateway {
    let lock_policy = FileLockPolicy::default();
    let paths = AccessStorePaths::for_state_dir(state_dir);
    let allow_list = Arc::new(FileAllowList::new(&paths.allowlist, lock_policy));
    let resolver = Arc::new(PairingResolver::new(
        PairingResolverConfig::new("wechat"),
        &paths,
        allow_list.clone(),
        allow_list,
    ));
    let fetcher = local_fetcher();
    let pipeline = Arc::new(ChannelPipeline::new(PipelineDependencies {
        channel: "wechat".to_string(),
        media_dir: state_dir.join("media"),
        resolver,
        ai_assistant: AiAssistantStore::new(&paths.ai_assistant, lock_policy),
        menu_payloads: MenuPayloadStore::new(&paths.menu_payloads, lock_policy),
        replies: Arc::new(ChannelApiClient::new(fetcher.clone())),
        media_fetcher: fetcher.clone(),
        agent: Arc::new(HttpAgentDispatcher::new(provider.url("/agent"), fetcher)),
    }));

    let account = ChannelAccountConfig {
        account_id: "main".to_string(),
        app_id: "wx-app".to_string(),
        app_secret: "app-secret".to_string(),
        token: WEBHOOK_TOKEN.to_string(),
        encoding_aes_key: None,
        webhook_path: "/hook".to_string(),
        enabled: true,
        pairing_token: Some(PAIRING_TOKEN.to_string()),
        api_base: provider.base_url(),
        debounce_ms: 0,
        unpaired_policy: UnpairedPolicy::Agent,
        ai_default_enabled: true,
        welcome_text: None,
    }
    .resolve()
    .expect("resolve account");
    pipeline.register_accounts(&[Arc::new(account)]);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(GatewayServerState::new(
        GatewayServerConfig::default(),
        pipeline,
    ));
    tokio::spawn(async move {
        let _ = serve_gateway(listener, state, std::future::pending()).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    RunningGateway {
        addr,
        state_dir: state_dir.to_path_buf(),
        client: reqwest::Client::new(),
    }
}

fn signed_webhook_url(addr: SocketAddr) -> String {
    let timestamp = "1700000000";
    let nonce = "integration";
    let signature = compute_signature(&[WEBHOOK_TOKEN, timestamp, nonce]);
    format!("http://{addr}/hook?signature={signature}&timestamp={timestamp}&nonce={nonce}")
}

fn text_envelope(msg_id: &str, content: &str) -> String {
    format!(
        "<xml><ToUserName><![CDATA[gh_main]]></ToUserName>\
         <FromUserName><![CDATA[o-subscriber]]></FromUserName>\
         <CreateTime>1700000000</CreateTime>\
         <MsgType><![CDATA[text]]></MsgType>\
         <Content><![CDATA[{content}]]></Content>\
         <MsgId>{msg_id}</MsgId></xml>"
    )
}

async fn deliver(gateway: &RunningGateway, msg_id: &str, content: &str) {
    let response = gateway
        .client
        .post(signed_webhook_url(gateway.addr))
        .body(text_envelope(msg_id, content))
        .send()
        .await
        .expect("deliver");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "success");
}

async fn wait_for_pending_code(state_dir: &Path) -> String {
    let path = state_dir.join("pairing-codes.json");
    for _ in 0..200 {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            let document: Value = serde_json::from_str(&raw).expect("pairing codes json");
            if let Some(code) = document["codes"]
                .as_object()
                .and_then(|codes| codes.keys().next().cloned())
            {
                return code;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no pairing code was issued");
}

#[tokio::test]
async fn integration_webhook_pairing_and_paired_dispatch_roundtrip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = MockServer::start();
    let token = provider.mock(|when, then| {
        when.method(GET).path("/cgi-bin/token");
        then.status(200)
            .json_body(json!({"access_token": "access-1", "expires_in": 7200}));
    });
    let send = provider.mock(|when, then| {
        when.method(POST)
            .path("/cgi-bin/message/custom/send")
            .query_param("access_token", "access-1");
        then.status(200).json_body(json!({"errcode": 0, "errmsg": "ok"}));
    });
    let paired_agent = provider.mock(|when, then| {
        when.method(POST)
            .path("/agent")
            .body_includes("\"access_tier\":\"paired\"");
        then.status(200)
            .json_body(json!({"reply": "hello, paired subscriber"}));
    });
    let gateway = start_gateway(temp.path(), &provider).await;

    deliver(&gateway, "1", "/pair").await;
    let code = wait_for_pending_code(&gateway.state_dir).await;

    let pair_url = format!("http://{}/hook/api/pair", gateway.addr);
    let approved = gateway
        .client
        .post(&pair_url)
        .json(&json!({"code": code, "token": PAIRING_TOKEN}))
        .send()
        .await
        .expect("approve");
    assert_eq!(approved.status(), 200);
    let body: Value = approved.json().await.expect("json");
    assert_eq!(body["accountId"], "main");
    assert_eq!(body["openId"], "o-subscriber");

    let replay = gateway
        .client
        .post(&pair_url)
        .json(&json!({"code": code, "token": PAIRING_TOKEN}))
        .send()
        .await
        .expect("replay");
    assert_eq!(replay.status(), 400);
    let body: Value = replay.json().await.expect("json");
    assert_eq!(body["error"]["message"], "invalid or expired pairing code");

    let allowlist: Value = serde_json::from_str(
        &std::fs::read_to_string(temp.path().join("allowlist.json")).expect("allowlist"),
    )
    .expect("allowlist json");
    assert_eq!(allowlist["channels"]["wechat"], json!(["main:o-subscriber"]));

    deliver(&gateway, "2", "hello").await;
    for _ in 0..200 {
        if send.calls() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    paired_agent.assert_calls(1);
    send.assert_calls(2);
    token.assert_calls(1);
}

#[tokio::test]
async fn integration_pair_api_rejects_wrong_token_and_unknown_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = MockServer::start();
    let gateway = start_gateway(temp.path(), &provider).await;
    let pair_url = format!("http://{}/hook/api/pair", gateway.addr);

    let wrong_token = gateway
        .client
        .post(&pair_url)
        .json(&json!({"code": "ABCDEFGH", "token": "not-the-token"}))
        .send()
        .await
        .expect("request");
    assert_eq!(wrong_token.status(), 401);

    let unknown_code = gateway
        .client
        .post(&pair_url)
        .json(&json!({"code": "ABCDEFGH", "token": PAIRING_TOKEN}))
        .send()
        .await
        .expect("request");
    assert_eq!(unknown_code.status(), 400);
}
