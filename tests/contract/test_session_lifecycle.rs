//! Contract tests for master and partition sessions
//!
//! A partition session must leave the master image as it found it: the
//! partition unmounted, no `/dev` binds left over and the partition's own
//! resolv.conf back in place.

use std::sync::Arc;

use lava_deploy::config::{DeviceConfig, TimeoutConfig};
use lava_deploy::session::settle;
use lava_deploy::shell::ShellCommand;
use lava_deploy::testing::{RecordingHost, Responder, ScriptedConsole};
use lava_deploy::{Error, SessionManager};

const PROMPT: &str = "root@master:~# ";
const RESOLV: &str = "/mnt/testrootfs/etc/resolv.conf";

fn sessions(console: &ScriptedConsole) -> SessionManager {
    let device: DeviceConfig = toml::from_str(
        r#"
        hostname = "panda01"
        device_type = "panda"
        connection_command = "conmux-console panda01"
        master_prompt = "root@master:"
        media_create_dev = "panda"
        "#,
    )
    .unwrap();
    SessionManager::new(
        Box::new(console.clone()),
        device,
        TimeoutConfig::default(),
        Arc::new(RecordingHost::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_partition_resolv_conf_restored() {
    let console = ScriptedConsole::ready(PROMPT);
    console.set_file(RESOLV, "nameserver 10.0.0.1\n");
    let mut sessions = sessions(&console);

    let session = sessions.partition_session("testrootfs").await.unwrap();
    assert_eq!(session.root(), "/mnt/testrootfs");
    assert_eq!(console.file(RESOLV).as_deref(), Some("nameserver 192.168.1.1\n"));
    assert_eq!(
        console.mounts(),
        vec!["/mnt/testrootfs", "/mnt/testrootfs/dev", "/mnt/testrootfs/dev/pts"]
    );

    session.release().await.unwrap();

    assert_eq!(console.file(RESOLV).as_deref(), Some("nameserver 10.0.0.1\n"));
    assert_eq!(console.file(&format!("{}.bak", RESOLV)), None);
    assert!(console.mounts().is_empty());
}

#[tokio::test]
async fn test_missing_resolv_conf_removed_on_release() {
    let console = ScriptedConsole::ready(PROMPT);
    let mut sessions = sessions(&console);

    let session = sessions.partition_session("testrootfs").await.unwrap();
    assert!(console.file(RESOLV).is_some());
    session.release().await.unwrap();

    assert_eq!(console.file(RESOLV), None);
    assert!(console.mounts().is_empty());
}

#[tokio::test]
async fn test_commands_run_inside_chroot() {
    let console = ScriptedConsole::ready(PROMPT);
    let mut sessions = sessions(&console);

    let mut session = sessions.reliable_session().await.unwrap();
    assert_eq!(session.label(), "testrootfs");
    let rc = session
        .runner()
        .run(&ShellCommand::new("apt-get").args(["install", "-y", "stress"]))
        .await
        .unwrap();
    session.master().run(&ShellCommand::new("sync")).await.unwrap();
    session.release().await.unwrap();

    assert_eq!(rc, 0);
    assert_eq!(
        console.sent_matching("apt-get"),
        vec!["chroot /mnt/testrootfs apt-get install -y stress"]
    );
    assert_eq!(console.sent_matching("sync"), vec!["sync"]);
}

#[tokio::test]
async fn test_release_order() {
    let console = ScriptedConsole::ready(PROMPT);
    console.set_file(RESOLV, "nameserver 10.0.0.1\n");
    let mut sessions = sessions(&console);

    let session = sessions.partition_session("testrootfs").await.unwrap();
    let opened = console.sent().len();
    session.release().await.unwrap();

    let teardown = console.sent()[opened..].to_vec();
    assert_eq!(teardown.len(), 3);
    assert!(teardown[0].starts_with("mv -f"));
    assert!(teardown[1].contains("grep '^/mnt/testrootfs/dev' | sort -r | xargs umount"));
    assert_eq!(teardown[2], "umount /mnt/testrootfs");
}

#[tokio::test]
async fn test_dev_binds_released_deepest_first() {
    let console = ScriptedConsole::ready(PROMPT);
    let mut sessions = sessions(&console);

    let mut session = sessions.partition_session("testrootfs").await.unwrap();
    session
        .master()
        .run_checked(
            &ShellCommand::new("mount").args(["--bind", "/dev/shm", "/mnt/testrootfs/dev/shm"]),
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
    session.release().await.unwrap();

    assert_eq!(
        console.unmounted(),
        vec![
            "/mnt/testrootfs/dev/shm",
            "/mnt/testrootfs/dev/pts",
            "/mnt/testrootfs/dev",
            "/mnt/testrootfs",
        ]
    );
    assert!(console.mounts().is_empty());
}

#[tokio::test]
async fn test_nonzero_status_is_not_an_error() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("false", Responder::Rc(1));
    let mut sessions = sessions(&console);

    let mut session = sessions.partition_session("testrootfs").await.unwrap();
    let rc = session.runner().run(&ShellCommand::new("false")).await;
    let rc = settle(rc, session.release().await).unwrap();

    assert_eq!(rc, 1);
    assert!(console.mounts().is_empty());
}

#[tokio::test]
async fn test_failure_inside_session_still_releases() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond_times("lava-test", Responder::Silence, 1);
    let mut sessions = sessions(&console);

    let mut session = sessions.partition_session("testrootfs").await.unwrap();
    let outcome = session.runner().run(&ShellCommand::new("lava-test").arg("run")).await;
    let err = settle(outcome, session.release().await).unwrap_err();

    assert!(matches!(err, Error::ConnectionTimeout { .. }));
    assert!(console.mounts().is_empty());
    assert_eq!(console.file(RESOLV), None);
}

#[tokio::test]
async fn test_mount_failure_leaves_nothing_to_undo() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("mount /dev/disk/by-label/testrootfs", Responder::Rc(32));
    let mut sessions = sessions(&console);

    let err = match sessions.partition_session("testrootfs").await {
        Ok(_) => panic!("session opened on an unmountable partition"),
        Err(e) => e,
    };

    assert!(matches!(err, Error::CommandFailed { rc: 32, .. }));
    assert!(console.sent_matching("umount").is_empty());
    assert!(console.sent_matching("resolv.conf").is_empty());
    assert!(console.mounts().is_empty());
}

#[tokio::test]
async fn test_busy_partition_reported_after_full_teardown() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("xargs umount", Responder::Rc(123));
    console.set_file(RESOLV, "nameserver 10.0.0.1\n");
    let mut sessions = sessions(&console);

    let session = sessions.partition_session("testrootfs").await.unwrap();
    let err = session.release().await.unwrap_err();

    assert!(matches!(err, Error::CommandFailed { rc: 16, .. }));
    assert_eq!(console.file(RESOLV).as_deref(), Some("nameserver 10.0.0.1\n"));
}

#[tokio::test]
async fn test_command_timeout_surfaces() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("sleep", Responder::Silence);
    let mut sessions = sessions(&console);

    let mut master = sessions.master_session().await.unwrap();
    let err = master
        .run(&ShellCommand::new("sleep").arg("600"))
        .await
        .unwrap_err();

    assert!(err.is_connection_error());
    assert!(err.to_string().contains("sleep 600"));
    assert_eq!(console.sent().last().map(String::as_str), Some("sleep 600"));
}

#[tokio::test]
async fn test_statuses_arrive_in_issue_order() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("first", Responder::Rc(3));
    console.respond("second", Responder::Rc(5));
    let mut sessions = sessions(&console);

    let mut master = sessions.master_session().await.unwrap();
    let a = master.run(&ShellCommand::new("first")).await.unwrap();
    let b = master.run(&ShellCommand::new("second")).await.unwrap();
    let c = master.run(&ShellCommand::new("true")).await.unwrap();

    assert_eq!((a, b, c), (3, 5, 0));
}

#[tokio::test]
async fn test_probe_detects_shell() {
    let up = ScriptedConsole::ready(PROMPT);
    sessions(&up)
        .probe_master_shell(std::time::Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(up.nudges(), 1);

    let down = ScriptedConsole::powered_off(PROMPT);
    let err = sessions(&down)
        .probe_master_shell(std::time::Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShellNotReady { .. }));
}

#[tokio::test]
async fn test_master_session_on_live_shell_does_not_reboot() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("reboot", Responder::Boot);
    let mut sessions = sessions(&console);

    let rc = sessions
        .master_session()
        .await
        .unwrap()
        .run(&ShellCommand::new("uptime"))
        .await
        .unwrap();

    assert_eq!(rc, 0);
    assert!(console.sent_matching("reboot").is_empty());
}
