//! Contract tests for boot recovery
//!
//! Each test scripts how the board reacts to resets and checks the path
//! the sequencer takes to the master shell, or that it gives up.

use std::sync::Arc;

use lava_deploy::boot::BootState;
use lava_deploy::config::{DeviceConfig, HardReset, TimeoutConfig};
use lava_deploy::testing::{RecordingHost, Responder, ScriptedConsole};
use lava_deploy::{Error, SessionManager};

const PROMPT: &str = "root@master:~# ";

fn device() -> DeviceConfig {
    toml::from_str(
        r#"
        hostname = "panda01"
        device_type = "panda"
        connection_command = "conmux-console panda01"
        master_prompt = "root@master:"
        media_create_dev = "panda"
        "#,
    )
    .unwrap()
}

fn sessions(console: &ScriptedConsole, device: DeviceConfig, host: &RecordingHost) -> SessionManager {
    SessionManager::new(
        Box::new(console.clone()),
        device,
        TimeoutConfig::default(),
        Arc::new(host.clone()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_soft_reboot_reaches_master_shell() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("reboot", Responder::Boot);
    let host = RecordingHost::new();

    let states = sessions(&console, device(), &host).boot_master_image().await.unwrap();

    assert_eq!(
        states,
        vec![
            BootState::Unknown,
            BootState::SoftRebooting,
            BootState::AwaitingKernelBanner,
            BootState::AwaitingShellPrompt { escalated: false },
            BootState::ConfiguringPrompt,
            BootState::MasterShellReady,
        ]
    );
    assert!(console.is_rc_prompt());
    assert!(console.sent_matching("~$hardreset").is_empty());
}

#[tokio::test]
async fn test_hung_board_recovers_with_one_hard_reset() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("reboot", Responder::Hang);
    console.respond("~$hardreset", Responder::Boot);
    let host = RecordingHost::new();

    let states = sessions(&console, device(), &host).boot_master_image().await.unwrap();

    assert!(states.contains(&BootState::HardRebooting));
    assert!(states.contains(&BootState::AwaitingShellPrompt { escalated: true }));
    assert_eq!(states.last(), Some(&BootState::MasterShellReady));
    assert_eq!(console.sent_matching("~$hardreset").len(), 1);
    assert!(console.is_rc_prompt());
}

#[tokio::test]
async fn test_gives_up_when_hard_reset_also_fails() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("reboot", Responder::Hang);
    console.respond("~$hardreset", Responder::Hang);
    let host = RecordingHost::new();

    let err = sessions(&console, device(), &host)
        .boot_master_image()
        .await
        .unwrap_err();

    match err {
        Error::BootFailed { state, reason } => {
            assert_eq!(state, "awaiting shell prompt after hard reset");
            assert!(reason.contains("root@master:"));
        }
        other => panic!("expected BootFailed, got {:?}", other),
    }
    assert_eq!(console.sent_matching("~$hardreset").len(), 1);
}

#[tokio::test]
async fn test_host_command_hard_reset() {
    let console = ScriptedConsole::ready(PROMPT);
    // The reboot is accepted but the kernel never announces itself
    console.respond("reboot", Responder::Silence);
    let host = RecordingHost::new();
    let mut device = device();
    device.hard_reset = HardReset::HostCommand(vec!["pdu-cycle".to_string(), "panda01".to_string()]);

    let states = sessions(&console, device, &host).boot_master_image().await.unwrap();

    assert_eq!(states.last(), Some(&BootState::MasterShellReady));
    let resets: Vec<_> = host
        .commands()
        .into_iter()
        .filter(|c| c.program == "pdu-cycle")
        .collect();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].args, vec!["panda01"]);
    assert!(console.sent_matching("~$hardreset").is_empty());
}

#[tokio::test]
async fn test_failing_reset_command_is_fatal() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("reboot", Responder::Hang);
    let host = RecordingHost::new();
    host.respond(
        "pdu-cycle",
        lava_deploy::host::HostOutput::failed(1, "outlet unreachable"),
    );
    let mut device = device();
    device.hard_reset = HardReset::HostCommand(vec!["pdu-cycle".to_string()]);

    let err = sessions(&console, device, &host)
        .boot_master_image()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BootFailed { ref reason, .. } if reason.contains("outlet unreachable")));
}

#[tokio::test]
async fn test_silent_prompt_reconfiguration_is_fatal_without_hard_reset() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("reboot", Responder::Boot);
    console.respond("export PS1", Responder::Silence);
    let host = RecordingHost::new();

    let err = sessions(&console, device(), &host)
        .boot_master_image()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BootFailed { ref state, .. } if state == "configuring prompt"));
    assert!(console.sent_matching("~$hardreset").is_empty());
}

#[tokio::test]
async fn test_closed_console_fails_boot() {
    let console = ScriptedConsole::ready(PROMPT);
    console.respond("reboot", Responder::Close);
    let host = RecordingHost::new();

    let err = sessions(&console, device(), &host)
        .boot_master_image()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BootFailed { .. }));
    assert!(err.to_string().contains("console closed"));
}

#[tokio::test]
async fn test_master_session_boots_powered_off_board() {
    let console = ScriptedConsole::powered_off(PROMPT);
    console.respond("reboot", Responder::Hang);
    console.respond("~$hardreset", Responder::Boot);
    let host = RecordingHost::new();
    let mut sessions = sessions(&console, device(), &host);

    let rc = sessions
        .master_session()
        .await
        .unwrap()
        .run(&lava_deploy::shell::ShellCommand::new("true"))
        .await
        .unwrap();

    assert_eq!(rc, 0);
    assert!(console.is_shell_up());
    assert_eq!(console.sent_matching("~$hardreset").len(), 1);
}
