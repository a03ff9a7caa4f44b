use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stokvel_admin::auth::hash_password;
use tokio::sync::Mutex;
use tokio::time::sleep;

const ADMIN_EMAIL: &str = "admin@stokvel.test";
const ADMIN_PASSWORD: &str = "let-me-in-please";

struct TestServer {
    base_url: String,
    child: Child,
    _data_dir: tempfile::TempDir,
}

impl TestServer {
    fn api(&self, path: &str) -> String {
        format!("{}/api/auth{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static SERVER: Lazy<Mutex<Option<Arc<TestServer>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(unix)]
mod cleanup {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Once;

    static REGISTER: Once = Once::new();
    static PID: AtomicI32 = AtomicI32::new(0);

    pub fn register(pid: u32) {
        REGISTER.call_once(|| {
            PID.store(pid as i32, Ordering::SeqCst);
            unsafe {
                libc::atexit(on_exit);
            }
        });
    }

    extern "C" fn on_exit() {
        let pid = PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn write_users(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("users.json");
    let users = json!([{
        "id": "1",
        "email": ADMIN_EMAIL,
        "name": "Admin User",
        "role": "admin",
        "passwordHash": hash_password(ADMIN_PASSWORD).unwrap(),
    }]);
    std::fs::write(&path, users.to_string()).unwrap();
    path
}

async fn wait_until_ready(base_url: &str) {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(resp) = client.get(format!("{base_url}/health")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        if Instant::now() > deadline {
            panic!("server did not become ready");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn spawn_server() -> TestServer {
    let port = pick_free_port();
    let data_dir = tempfile::tempdir().expect("temp data dir");
    let users_path = write_users(data_dir.path());

    let child = Command::new(env!("CARGO_BIN_EXE_stokvel_admin"))
        .env("PORT", port.to_string())
        .env("STOKVEL_DATA_DIR", data_dir.path())
        .env("STOKVEL_USERS_PATH", users_path)
        .env("JWT_SECRET", "integration-secret-integration-secret")
        .env("SMS_GATEWAY", "always-sent")
        .env("REMINDER_JOB_INTERVAL_SECS", "0")
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn server");

    #[cfg(unix)]
    cleanup::register(child.id());

    let base_url = format!("http://127.0.0.1:{port}");
    wait_until_ready(&base_url).await;

    TestServer {
        base_url,
        child,
        _data_dir: data_dir,
    }
}

async fn shared_server() -> Arc<TestServer> {
    let mut guard = SERVER.lock().await;
    if let Some(server) = guard.as_ref() {
        return Arc::clone(server);
    }
    let server = Arc::new(spawn_server().await);
    *guard = Some(Arc::clone(&server));
    server
}

async fn login(server: &TestServer, client: &Client) -> String {
    let body: Value = client
        .post(server.api("/login"))
        .json(&json!({ "email": ADMIN_EMAIL, "password": ADMIN_PASSWORD }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    body["token"].as_str().unwrap().to_string()
}

async fn create_group(server: &TestServer, client: &Client, token: &str, name: &str) -> Value {
    let response = client
        .post(server.api("/groups"))
        .bearer_auth(token)
        .json(&json!({ "name": name, "monthlyAmount": 500, "dueDay": 25 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    body["data"].clone()
}

async fn add_member(
    server: &TestServer,
    client: &Client,
    token: &str,
    group_id: &str,
    name: &str,
) -> Value {
    let response = client
        .post(server.api(&format!("/groups/{group_id}/members")))
        .bearer_auth(token)
        .json(&json!({ "name": name, "phone": "0821234567" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    body["data"].clone()
}

async fn find_group(server: &TestServer, client: &Client, token: &str, group_id: &str) -> Value {
    let body: Value = client
        .get(server.api("/groups"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|group| group["id"] == group_id)
        .cloned()
        .expect("group missing from list")
}

#[tokio::test]
async fn http_requires_session_for_api_routes() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let response = client.get(server.api("/groups")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);

    let response = client
        .post(server.api("/login"))
        .json(&json!({ "email": ADMIN_EMAIL, "password": "wrong" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn http_login_cookie_drives_check_and_logout() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::builder().cookie_store(true).build().unwrap();

    login(&server, &client).await;

    let check: Value = client
        .get(server.api("/check"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check["authenticated"], true);
    assert_eq!(check["user"]["email"], ADMIN_EMAIL);

    let groups = client.get(server.api("/groups")).send().await.unwrap();
    assert!(groups.status().is_success());

    client.post(server.api("/logout")).send().await.unwrap();
    let after = client.get(server.api("/check")).send().await.unwrap();
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn http_group_lifecycle_keeps_member_count() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let group = create_group(&server, &client, &token, "Lifecycle Circle").await;
    let group_id = group["id"].as_str().unwrap();
    assert_eq!(group["totalMembers"], 0);
    assert_eq!(group["reminderDays"], 3);

    let listed = find_group(&server, &client, &token, group_id).await;
    assert_eq!(listed["name"], "Lifecycle Circle");
    assert_eq!(listed["monthlyAmount"], 500.0);
    assert_eq!(listed["dueDay"], 25);
    assert_eq!(listed["status"], "active");

    let first = add_member(&server, &client, &token, group_id, "Lerato").await;
    add_member(&server, &client, &token, group_id, "Sipho").await;
    assert_eq!(first["paymentStatus"], "pending");
    assert_eq!(find_group(&server, &client, &token, group_id).await["totalMembers"], 2);

    let response = client
        .delete(server.api(&format!("/members/{}", first["id"].as_str().unwrap())))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(find_group(&server, &client, &token, group_id).await["totalMembers"], 1);

    let response = client
        .delete(server.api(&format!("/groups/{group_id}/members")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(find_group(&server, &client, &token, group_id).await["totalMembers"], 0);

    let members: Value = client
        .get(server.api(&format!("/groups/{group_id}/members")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(members["count"], 0);
    assert!(members["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn http_rejects_invalid_input() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let response = client
        .post(server.api("/groups"))
        .bearer_auth(&token)
        .json(&json!({ "name": "No Amount", "dueDay": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let group = create_group(&server, &client, &token, "Validation Circle").await;
    let group_id = group["id"].as_str().unwrap();

    let response = client
        .post(server.api(&format!("/groups/{group_id}/members")))
        .bearer_auth(&token)
        .json(&json!({ "name": "No Phone" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let member = add_member(&server, &client, &token, group_id, "Naledi").await;
    let response = client
        .post(server.api(&format!("/members/{}/payments", member["id"].as_str().unwrap())))
        .bearer_auth(&token)
        .json(&json!({ "amount": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(find_group(&server, &client, &token, group_id).await["totalCollected"], 0.0);

    let response = client
        .delete(server.api("/members/member_does_not_exist"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_payment_updates_member_group_and_ledger() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let group = create_group(&server, &client, &token, "Payments Circle").await;
    let group_id = group["id"].as_str().unwrap();
    let member = add_member(&server, &client, &token, group_id, "Thandi").await;
    let member_id = member["id"].as_str().unwrap();

    let response = client
        .post(server.api(&format!("/members/{member_id}/payments")))
        .bearer_auth(&token)
        .json(&json!({ "amount": 1500, "paymentMethod": "eft" }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["paymentStatus"], "paid");
    assert_eq!(body["data"]["totalPaid"], 1500.0);

    assert_eq!(find_group(&server, &client, &token, group_id).await["totalCollected"], 1500.0);

    let history: Value = client
        .get(server.api(&format!("/members/{member_id}/payments")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["data"][0]["method"], "eft");

    let ledger: Value = client
        .get(server.api(&format!("/payments?groupId={group_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ledger["data"]["payments"].as_array().unwrap().len(), 4);
    assert_eq!(ledger["data"]["summary"]["paidCount"], 4);
    assert_eq!(ledger["data"]["summary"]["paymentRate"], 100);
}

#[tokio::test]
async fn http_manual_reminders_are_sent_and_logged() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let group = create_group(&server, &client, &token, "Reminder Circle").await;
    let group_id = group["id"].as_str().unwrap();
    let member = add_member(&server, &client, &token, group_id, "Bongani").await;
    let member_id = member["id"].as_str().unwrap();

    let response = client
        .post(server.api("/reminders/send"))
        .bearer_auth(&token)
        .json(&json!({ "memberIds": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = client
        .post(server.api("/reminders/send"))
        .bearer_auth(&token)
        .json(&json!({ "memberIds": [member_id, "member_ghost"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["sent"], 1);
    assert_eq!(body["data"]["failed"], 1);
    assert_eq!(body["data"]["total"], 2);

    let logs: Value = client
        .get(server.api("/reminders/logs?type=manual&status=sent"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let mine: Vec<&Value> = logs["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|log| log["memberId"] == member_id)
        .collect();
    assert_eq!(mine.len(), 1);
    assert_eq!(
        mine[0]["message"],
        "Hi Bongani, please pay R500 for Reminder Circle by 25th."
    );
}

#[tokio::test]
async fn http_group_settings_fall_back_to_global() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let group = create_group(&server, &client, &token, "Settings Circle").await;
    let group_id = group["id"].as_str().unwrap();

    let response = client
        .put(server.api("/reminders/settings"))
        .bearer_auth(&token)
        .json(&json!({ "groupId": group_id, "settings": { "maxRetries": 7 } }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let settings: Value = client
        .get(server.api(&format!("/reminders/settings?groupId={group_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settings["data"]["maxRetries"], 7);
    assert_eq!(settings["data"]["enableAutoReminders"], true);
}

#[tokio::test]
async fn http_reminder_log_is_recorded_and_filtered() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let response = client
        .post(server.api("/reminders/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "memberId": "member_external",
            "memberName": "Zanele",
            "message": "Logged from the admin console",
            "type": "scheduled",
            "status": "failed",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["id"].as_str().unwrap().starts_with("reminder_"));
    assert_eq!(body["data"]["memberId"], "member_external");
    assert_eq!(body["data"]["type"], "scheduled");
    assert_eq!(body["data"]["status"], "failed");

    for invalid in [
        json!({ "memberId": "member_external", "message": "   " }),
        json!({ "memberId": " ", "message": "hello" }),
        json!({ "message": "no member" }),
    ] {
        let response = client
            .post(server.api("/reminders/logs"))
            .bearer_auth(&token)
            .json(&invalid)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
    }

    let logs: Value = client
        .get(server.api("/reminders/logs?days=1&type=scheduled&status=failed"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|log| log["memberId"] == "member_external"));

    let response = client
        .get(server.api("/reminders/logs?days=1000000000"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn http_stats_and_report_reflect_payments() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let group = create_group(&server, &client, &token, "Report Circle").await;
    let group_id = group["id"].as_str().unwrap();
    let payer = add_member(&server, &client, &token, group_id, "Mpho").await;
    add_member(&server, &client, &token, group_id, "Kagiso").await;

    let response = client
        .post(server.api(&format!("/members/{}/payments", payer["id"].as_str().unwrap())))
        .bearer_auth(&token)
        .json(&json!({ "amount": 500, "paymentMethod": "cash" }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let stats: Value = client
        .get(server.api("/groups/stats"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["success"], true);
    assert!(stats["data"]["totalGroups"].as_u64().unwrap() >= 1);
    assert!(stats["data"]["activeGroups"].as_u64().unwrap() >= 1);
    assert!(stats["data"]["totalMembers"].as_u64().unwrap() >= 2);
    assert!(stats["data"]["totalCollected"].as_f64().unwrap() >= 500.0);

    let report: Value = client
        .get(server.api(&format!("/reports?groupId={group_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let summary = &report["data"]["summary"];
    assert_eq!(summary["totalGroups"], 1);
    assert_eq!(summary["totalMembers"], 2);
    assert_eq!(summary["totalCollected"], 500.0);
    assert_eq!(summary["collectionRate"], 50);
    assert_eq!(summary["bestPerformingGroup"], "Report Circle");

    let performance = &report["data"]["groupPerformance"][0];
    assert_eq!(performance["id"], group_id);
    assert_eq!(performance["paidMembers"], 1);
    assert_eq!(performance["potentialRevenue"], 12000.0);
    assert_eq!(report["data"]["paymentMethods"]["cash"], 1);
}

#[tokio::test]
async fn http_overflowing_payment_is_rejected_with_envelope() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let token = login(&server, &client).await;

    let group = create_group(&server, &client, &token, "Overflow Circle").await;
    let group_id = group["id"].as_str().unwrap();
    let member = add_member(&server, &client, &token, group_id, "Ayanda").await;
    let url = server.api(&format!("/members/{}/payments", member["id"].as_str().unwrap()));

    let first = client
        .post(&url)
        .bearer_auth(&token)
        .json(&json!({ "amount": 4e28 }))
        .send()
        .await
        .unwrap();
    assert!(first.status().is_success());

    let second = client
        .post(&url)
        .bearer_auth(&token)
        .json(&json!({ "amount": 4e28 }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Amount is out of range");

    let stats = client
        .get(server.api("/groups/stats"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert!(stats.status().is_success());
}
