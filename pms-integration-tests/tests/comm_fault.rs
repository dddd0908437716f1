use pms_devkit::TestHarness;
use pms_kernel::automation::fault_recovery::SequencerState;
use pms_kernel::devices::DeviceCommand;
use pms_kernel::models::FieldValue;
use std::time::Duration;
use tokio::time::sleep;

fn fault(active: bool) -> [(&'static str, FieldValue); 2] {
    [
        ("battery_soc", FieldValue::Number(50.0)),
        ("error_code_2", FieldValue::Status(if active { 1 << 3 } else { 0 })),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_single_recovery_with_fixed_spacing() {
    let harness = TestHarness::new();
    harness.battery.set_default_fields(fault(true));
    let ops = harness.start_operations();
    harness.scheduler().start();

    // trois snapshots en défaut pendant la séquence
    sleep(Duration::from_millis(2500)).await;
    harness.battery.set_default_fields(fault(false));
    sleep(Duration::from_secs(20)).await;

    let bms = harness.battery.commands();
    let pcs = harness.converter.commands();
    assert_eq!(harness.battery.command_names(), vec!["reset_errors", "contactor"]);
    assert_eq!(bms[1].command, DeviceCommand::Contactor { closed: true });
    assert_eq!(harness.converter.command_names(), vec!["reset_faults", "independent"]);

    assert_eq!(bms[1].at - bms[0].at, Duration::from_secs(2));
    assert_eq!(pcs[0].at - bms[1].at, Duration::from_secs(3));
    assert_eq!(pcs[1].at - pcs[0].at, Duration::from_secs(2));

    let status = ops.fault_recovery().unwrap();
    assert_eq!((status.attempts, status.completed), (1, 1));
    assert_eq!(status.state, SequencerState::Idle);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_aborts_and_next_detection_restarts() {
    let harness = TestHarness::new();
    harness.converter.fail_command("reset_faults");
    harness.battery.push_fields(fault(true));
    harness.battery.set_default_fields(fault(false));
    let ops = harness.start_operations();
    harness.scheduler().start();

    sleep(Duration::from_secs(10)).await;
    // reset_faults refusé : la mise en service du PCS n'est jamais tentée
    assert_eq!(harness.converter.command_names(), vec!["reset_faults"]);
    let status = ops.fault_recovery().unwrap();
    assert_eq!((status.attempts, status.completed), (1, 0));
    assert!(status.last_error.unwrap().contains("reset_faults"));

    // nouvelle détection : séquence reprise depuis le début
    harness.converter.clear_commands();
    harness.battery.clear_commands();
    harness.battery.push_fields(fault(true));
    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.battery.command_names(), vec!["reset_errors", "contactor"]);
    assert_eq!(ops.fault_recovery().unwrap().attempts, 2);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_runs_in_auto_mode_too() {
    let harness = TestHarness::new();
    harness.battery.set_default_fields(fault(false));
    harness.scheduler().start();
    let mut ops = harness.start_operations();
    ops.start_auto().await.unwrap();
    while let Some(status) = ops.soc_changed().await {
        if status.current_state == pms_kernel::automation::soc::AutoState::Running {
            break;
        }
    }
    harness.battery.clear_commands();
    harness.battery.push_fields(fault(true));
    sleep(Duration::from_secs(10)).await;

    assert_eq!(harness.battery.command_names(), vec!["reset_errors", "contactor"]);
    assert_eq!(ops.fault_recovery().unwrap().completed, 1);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_step_times_out_and_frees_sequencer() {
    let harness = TestHarness::new();
    harness.converter.hang_commands(true);
    harness.battery.push_fields(fault(true));
    harness.battery.set_default_fields(fault(false));
    let ops = harness.start_operations();
    harness.scheduler().start();

    // 2s + 3s d'espacement puis reset_faults sans réponse
    sleep(Duration::from_secs(10)).await;
    assert_eq!(ops.fault_recovery().unwrap().state, SequencerState::Recovering);

    sleep(Duration::from_secs(15)).await;
    assert_eq!(harness.converter.command_names(), vec!["reset_faults"]);
    let status = ops.fault_recovery().unwrap();
    assert_eq!(status.state, SequencerState::Idle);
    assert_eq!((status.attempts, status.completed), (1, 0));
    assert!(status.last_error.unwrap().contains("no answer within"));

    // le séquenceur accepte une nouvelle détection
    harness.converter.hang_commands(false);
    harness.battery.clear_commands();
    harness.battery.push_fields(fault(true));
    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.battery.command_names(), vec!["reset_errors", "contactor"]);
    assert_eq!(ops.fault_recovery().unwrap().completed, 1);
    harness.shutdown().await;
}
