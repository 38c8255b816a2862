//! Client connection scenarios against a directory-backed store.

use cairn_core::{bootstrap, password_hash, Conn, CoreError, Info, Lifecycle, State};
use cairn_schema::{
    AgentId, CharmArchive, CharmMeta, CharmUrl, EnvironConfig, Life, ResolvedMode, StateConfig,
    StatusData, WorkloadStatus,
};
use cairn_watch::{Notification, PresenceChange, PresenceWatcher, Subscription};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

const WORDPRESS: &str = r#"
name = "wordpress"
summary = "Blog engine"

[provides.url]
interface = "http"

[requires.db]
interface = "mysql"
"#;

const LOGGING: &str = r#"
name = "logging"
subordinate = true

[provides.logging-client]
interface = "logging"

[requires.info]
interface = "juju-info"
scope = "container"
"#;

const RIAK: &str = r#"
name = "riak"

[provides.endpoint]
interface = "http"

[peers.ring]
interface = "riak"
"#;

fn environ(secret_key: &str) -> EnvironConfig {
    EnvironConfig::from_toml_str(&format!(
        "name = \"erewhemos\"\ntype = \"dummy\"\nadmin-secret = \"pork\"\nsecret-key = \"{secret_key}\"\n"
    ))
    .unwrap()
}

fn info(dir: &Path) -> Info {
    Info {
        addrs: vec![format!("file:{}", dir.display())],
        ..Info::default()
    }
}

fn fast_config() -> StateConfig {
    StateConfig::from_toml_str(
        "[watcher]\npoll_interval_ms = 10\n\n[presence]\nping_interval_ms = 20\n",
    )
    .unwrap()
}

fn connect(dir: &Path) -> Conn {
    let env = environ("ssh");
    let st = bootstrap(&info(dir), fast_config(), &env, None).unwrap();
    st.close().unwrap();
    Conn::new(env, info(dir), fast_config(), None).unwrap()
}

fn archive(meta: &str, bytes: &[u8]) -> CharmArchive {
    CharmArchive::new(CharmMeta::parse_str(meta).unwrap(), bytes.to_vec())
}

fn deploy(conn: &Conn, meta: &str, name: &str) -> cairn_core::Service {
    let parsed = CharmMeta::parse_str(meta).unwrap();
    let url: CharmUrl = format!("local:series/{}", parsed.name).parse().unwrap();
    let charm = conn.put_charm(&url, &archive(meta, b"bundle"), false).unwrap();
    conn.add_service(name, &charm).unwrap()
}

fn assert_unit_life(st: &State, name: &str, life: Life) {
    let mut unit = st.unit(name).unwrap();
    unit.refresh().unwrap();
    assert_eq!(unit.life(), life, "life of {name}");
}

async fn wait_for_flip(
    presence: &PresenceWatcher,
    sub: &mut Subscription<AgentId, PresenceChange>,
    alive: bool,
) {
    timeout(WAIT, async {
        loop {
            presence.sync().await.unwrap();
            match sub.recv().await {
                Some(Notification::Changes(changes)) => {
                    if changes.iter().any(|c| c.alive == alive) {
                        return;
                    }
                }
                Some(Notification::Resync) => {}
                None => panic!("presence subscription closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("agent never became alive={alive}"));
}

#[test]
fn connecting_requires_admin_secret() {
    let dir = tempfile::tempdir().unwrap();
    let env = environ("ssh").without_attr("admin-secret");
    let err = Conn::new(env.clone(), info(dir.path()), StateConfig::default(), None)
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "cannot connect without admin-secret");
    assert!(bootstrap(&info(dir.path()), StateConfig::default(), &env, None).is_err());
}

#[test]
fn first_connection_rotates_admin_password() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    conn.close().unwrap();

    let mut plain = info(dir.path());
    plain.password = "pork".to_owned();
    State::open(&plain, StateConfig::default(), None)
        .unwrap()
        .close()
        .unwrap();

    let mut hashed = info(dir.path());
    hashed.password = password_hash("pork");
    assert!(matches!(
        State::open(&hashed, StateConfig::default(), None),
        Err(CoreError::Unauthorized(_))
    ));
}

#[test]
fn stored_config_keeps_no_secrets_until_connect() {
    let dir = tempfile::tempdir().unwrap();
    let st = bootstrap(&info(dir.path()), StateConfig::default(), &environ("ssh"), None).unwrap();
    let stored = st.environ_config().unwrap();
    assert_eq!(stored.name(), "erewhemos");
    assert_eq!(stored.admin_secret(), None);
    assert!(stored.unknown_attrs().is_empty());
    st.close().unwrap();
}

#[test]
fn secrets_are_pushed_once() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let stored = conn.state().environ_config().unwrap();
    assert_eq!(stored.all_attrs().get("secret-key"), Some(&json!("ssh")));
    conn.close().unwrap();

    let other = Conn::new(environ("pork"), info(dir.path()), fast_config(), None).unwrap();
    let stored = other.state().environ_config().unwrap();
    assert_eq!(stored.all_attrs().get("secret-key"), Some(&json!("ssh")));
    other.close().unwrap();
}

#[test]
fn put_charm_revisions() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let url: CharmUrl = "local:series/riak".parse().unwrap();

    let first = conn.put_charm(&url, &archive(RIAK, b"one"), false).unwrap();
    assert_eq!(first.revision(), 0);
    let again = conn.put_charm(&url, &archive(RIAK, b"two"), false).unwrap();
    assert_eq!(again, first);

    let bumped = conn.put_charm(&url, &archive(RIAK, b"two"), true).unwrap();
    assert_eq!(bumped.revision(), 1);
    assert_eq!(bumped.url().to_string(), "local:series/riak-1");

    let pinned = conn
        .put_charm(&url.with_revision(5), &archive(RIAK, b"five"), false)
        .unwrap();
    assert_eq!(pinned.revision(), 5);
    assert_eq!(
        conn.state().latest_charm(&url).unwrap().unwrap().revision(),
        5
    );
}

#[test]
fn concurrent_bumps_take_consecutive_revisions() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let url: CharmUrl = "local:series/riak".parse().unwrap();
    conn.put_charm(&url, &archive(RIAK, b"base"), false).unwrap();
    conn.close().unwrap();

    let config = StateConfig::from_toml_str("[txn]\nmax_attempts = 8\n").unwrap();
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let root = dir.path().to_path_buf();
            let url = url.clone();
            let config = config.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let conn = Conn::new(environ("ssh"), info(&root), config, None).unwrap();
                barrier.wait();
                let charm = conn.put_charm(&url, &archive(RIAK, &[t]), true).unwrap();
                conn.close().unwrap();
                charm.revision()
            })
        })
        .collect();
    let mut revisions: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    revisions.sort_unstable();
    assert_eq!(revisions, [1, 2, 3, 4]);

    let conn = Conn::new(environ("ssh"), info(dir.path()), StateConfig::default(), None).unwrap();
    let latest = conn.state().latest_charm(&url).unwrap().unwrap();
    assert_eq!(latest.revision(), 4);
    conn.close().unwrap();
}

#[test]
fn add_units_assigns_fresh_machines() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let mut svc = deploy(&conn, WORDPRESS, "");
    let units = conn.add_units(&mut svc, 2).unwrap();
    let machines: Vec<Option<&str>> = units.iter().map(|u| u.machine_id()).collect();
    assert_eq!(machines, [Some("0"), Some("1")]);
    assert!(matches!(
        conn.add_units(&mut svc, 0),
        Err(CoreError::Validation(_))
    ));
}

#[test]
fn destroy_units() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let st = conn.state();
    let mut svc = deploy(&conn, WORDPRESS, "");
    conn.add_units(&mut svc, 3).unwrap();

    conn.destroy_units(&["wordpress/0", "wordpress/1"]).unwrap();
    assert_unit_life(st, "wordpress/0", Life::Dying);
    assert_unit_life(st, "wordpress/1", Life::Dying);

    // The live unit is destroyed even though the dying one is refused.
    let err = conn
        .destroy_units(&["wordpress/2", "wordpress/0"])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot destroy units: unit \"wordpress/0\" is not alive"
    );
    assert!(matches!(err, CoreError::Aggregate { .. }));
    assert_unit_life(st, "wordpress/2", Life::Dying);

    conn.add_units(&mut svc, 1).unwrap();
    let err = conn
        .destroy_units(&["wordpress/3", "boojum/123"])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot destroy units: unit \"boojum/123\" is not alive"
    );
    assert_unit_life(st, "wordpress/3", Life::Dying);

    conn.add_units(&mut svc, 1).unwrap();
    conn.destroy_units(&["wordpress/4", "wordpress/4"]).unwrap();
    assert_unit_life(st, "wordpress/4", Life::Dying);
}

#[test]
fn destroy_subordinate_units() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let st = conn.state();
    let mut wordpress = deploy(&conn, WORDPRESS, "wordpress");
    let mut wordpress0 = wordpress.add_unit().unwrap();
    wordpress0.set_private_address("meh").unwrap();
    deploy(&conn, LOGGING, "logging");

    let eps = st.infer_endpoints(&["logging", "wordpress"]).unwrap();
    let rel = st.add_relation(&eps).unwrap();
    rel.unit(&wordpress0).unwrap().enter_scope().unwrap();

    let err = conn.destroy_units(&["logging/0"]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot destroy units: unit \"logging/0\" is a subordinate"
    );
    assert_unit_life(st, "logging/0", Life::Alive);

    let err = conn
        .destroy_units(&["wordpress/0", "logging/0"])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot destroy units: unit \"logging/0\" is a subordinate"
    );
    assert_unit_life(st, "wordpress/0", Life::Dying);
    assert_unit_life(st, "logging/0", Life::Alive);

    // Principal destruction leaves the subordinate to its own agent.
    let mut wordpress0 = st.unit("wordpress/0").unwrap();
    assert!(wordpress0.ensure_dead().is_err());
    assert_unit_life(st, "logging/0", Life::Alive);
}

#[test]
fn resolved() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let mut svc = deploy(&conn, RIAK, "testriak");
    let mut unit = conn.add_units(&mut svc, 1).unwrap().remove(0);

    let err = conn.resolved(&mut unit, false).unwrap_err();
    assert_eq!(
        err.to_string(),
        "unit \"testriak/0\" is not in an error state"
    );

    unit.set_status(WorkloadStatus::Error, "gaaah", StatusData::new())
        .unwrap();
    conn.resolved(&mut unit, false).unwrap();
    let err = conn.resolved(&mut unit, true).unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot set resolved mode for unit \"testriak/0\": already resolved"
    );
    assert_eq!(
        conn.state().unit("testriak/0").unwrap().resolved(),
        ResolvedMode::RetryHooks
    );

    unit.clear_resolved().unwrap();
    conn.resolved(&mut unit, true).unwrap();
    assert_eq!(
        conn.state().unit("testriak/0").unwrap().resolved(),
        ResolvedMode::NoHooks
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unit_changes_reach_watchers() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let mut svc = deploy(&conn, RIAK, "");
    let mut unit = svc.add_unit().unwrap();

    let watcher = conn.state().watcher().unwrap();
    watcher.sync().await.unwrap();
    let mut sub = unit.watch().unwrap();
    unit.set_status(WorkloadStatus::Active, "", StatusData::new())
        .unwrap();
    watcher.sync().await.unwrap();

    timeout(WAIT, async {
        loop {
            match sub.recv().await {
                Some(Notification::Changes(changes)) => {
                    if changes.iter().any(|c| c.id == "riak/0") {
                        return;
                    }
                }
                Some(Notification::Resync) => return,
                None => panic!("subscription closed"),
            }
        }
    })
    .await
    .unwrap();
    conn.close().unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn change_committed_before_first_poll_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let mut svc = deploy(&conn, RIAK, "");
    let mut unit = svc.add_unit().unwrap();

    // Nothing has yielded to the tail task yet.
    let mut sub = unit.watch().unwrap();
    unit.set_status(WorkloadStatus::Active, "", StatusData::new())
        .unwrap();
    let name = unit.name().to_string();

    match timeout(Duration::from_secs(2), sub.recv()).await.unwrap() {
        Some(Notification::Changes(changes)) => {
            assert!(changes.iter().any(|c| c.id == name && c.revno.is_some()));
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    conn.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_presence_follows_pinger() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let mut svc = deploy(&conn, RIAK, "");
    let unit = svc.add_unit().unwrap();
    assert!(!unit.agent_alive().unwrap());

    let mut sub = unit.watch_agent().unwrap();
    let pinger = unit.set_agent_alive().unwrap();
    let presence = conn.state().presence().unwrap();
    wait_for_flip(presence, &mut sub, true).await;
    assert!(unit.agent_alive().unwrap());

    pinger.kill().await.unwrap();
    wait_for_flip(presence, &mut sub, false).await;
    assert!(!unit.agent_alive().unwrap());
    conn.close().unwrap();
}
