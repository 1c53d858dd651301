//! End-to-end runs of the Hi-M task against the simulated rig.
//!
//! All tests use paused tokio time; injections, incubations and rinses complete in
//! simulated minutes.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{
    assert_duration_near, RunFixture, TimingTolerance, HYBRIDIZATION, TRIPLE_NEEDLE_HYBRIDIZATION,
};
use him_daq::alert::OperatorAlert;
use him_daq::experiment::records::{EVENTS_FILE, PARAMETERS_FILE, STATUS_FILE};
use him_daq::experiment::status::StatusRecorder;
use him_daq::experiment::{
    run_task, InterruptableTask, Process, RunStatus, TaskServices, TaskState,
};
use him_daq::hardware::ValveBank;
use him_daq::upload::NetworkProbe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct RecordingAlert(Mutex<Vec<String>>);

struct FixedNetwork(bool);

#[async_trait]
impl NetworkProbe for FixedNetwork {
    async fn is_reachable(&self) -> bool {
        self.0
    }
}

#[async_trait]
impl OperatorAlert for RecordingAlert {
    async fn send(&self, subject: &str, _body: &str) -> Result<()> {
        self.0.lock().unwrap().push(subject.to_string());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_step_per_probe() {
    let fixture = RunFixture::new(&[(1, "RT1"), (2, "RT2"), (3, "RT3")], HYBRIDIZATION);
    let mut task = fixture.task();

    task.start().await.unwrap();
    assert_eq!(task.state(), TaskState::Running);

    assert!(task.step().await);
    assert!(task.step().await);
    assert!(!task.step().await);
    assert_eq!(task.cycles_run(), 3);
    assert!(!task.was_aborted());

    task.cleanup().await;
    assert_eq!(task.state(), TaskState::Terminated);
    assert_eq!(fixture.rig.needle.moves().await, vec![1, 2, 3]);
    // 3 probes x 2 ROIs, data file plus metadata each
    assert_eq!(fixture.rig.camera.saved().await.len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_configured_prefix_names_stacks() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION).with_config(
        "[experiment]\nfile_prefix = \"Embryo\"\n",
    );
    let mut task = fixture.task();
    assert_eq!(run_task(&mut task).await, TaskState::Terminated);

    let roi = task.run_directory().unwrap().root.join("ROI_001");
    assert!(roi.join("scan_Embryo_RT1_001_ROI.tif").exists());
}

#[tokio::test(start_paused = true)]
async fn test_step_after_last_probe_does_nothing() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let mut task = fixture.task();
    task.start().await.unwrap();

    assert!(!task.step().await);
    assert!(!task.step().await);
    assert_eq!(task.cycles_run(), 1);
    assert_eq!(task.state(), TaskState::Running);
    assert_eq!(fixture.rig.needle.moves().await, vec![1]);
    task.cleanup().await;
    assert!(!task.was_aborted());
}

#[tokio::test(start_paused = true)]
async fn test_needle_valve_selected_before_each_sequence() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let mut task = fixture.task();
    assert_eq!(run_task(&mut task).await, TaskState::Terminated);

    let history = fixture.rig.valves.history().await;
    assert_eq!(
        &history[..6],
        &[
            // hybridization: delivery, probe buffer, then parked
            (ValveBank::Needle, 1),
            (ValveBank::Buffer, 7),
            (ValveBank::Buffer, 1),
            (ValveBank::Needle, 1),
            // photobleaching: delivery, wash buffer
            (ValveBank::Needle, 1),
            (ValveBank::Buffer, 1),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cycle_duration_follows_fluidics() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let mut task = fixture.task();
    task.start().await.unwrap();

    let started = Instant::now();
    assert!(!task.step().await);
    let elapsed = started.elapsed();

    // 60 s injection, 60 s incubation, 30 s photobleaching, 35 s rinse, plus motion and imaging
    assert!(elapsed >= Duration::from_secs(185), "cycle took {elapsed:?}");
    assert_duration_near(
        elapsed,
        Duration::from_secs(200),
        TimingTolerance::Normal,
        "single probe cycle",
    );
    task.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_run_records_written() {
    let fixture = RunFixture::new(&[(4, "RT4")], HYBRIDIZATION);
    let mut task = fixture.task();
    let status = task.status_receiver();

    let state = run_task(&mut task).await;
    assert_eq!(state, TaskState::Terminated);
    assert!(task.run_id().is_some());

    let directory = task.run_directory().unwrap();
    assert!(directory.name().ends_with("_HiM_fixture"));
    assert!(directory.metadata_file(EVENTS_FILE).exists());
    assert!(directory.metadata_file(PARAMETERS_FILE).exists());

    let events = std::fs::read_to_string(directory.metadata_file(EVENTS_FILE)).unwrap();
    assert!(events.contains("Task started"));
    assert!(events.contains("Finished cycle 1"));

    // the status record is reset once the run is over
    let recorded = StatusRecorder::new(directory.metadata_file(STATUS_FILE))
        .read()
        .unwrap();
    assert_eq!(recorded, RunStatus::default());
    assert_eq!(status.borrow().process, Process::None);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_twice_enables_controls_once() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let mut task = fixture.task();

    task.start().await.unwrap();
    assert_eq!(fixture.rig.controls.disable_count(), 1);
    task.cleanup().await;
    task.cleanup().await;

    assert_eq!(task.state(), TaskState::Terminated);
    assert_eq!(fixture.rig.controls.enable_count(), 1);
    assert_eq!(fixture.rig.controls.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_needle_not_homed_aborts_start() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    fixture.rig.needle.set_origin_defined(false);
    let mut task = fixture.task();

    assert!(task.start().await.is_err());
    assert_eq!(task.state(), TaskState::Aborted);
    assert!(!task.step().await);
    assert_eq!(fixture.rig.controls.enable_count(), 1);

    task.cleanup().await;
    assert!(task.was_aborted());
    assert!(task.run_directory().is_none());
    assert!(fixture.rig.needle.moves().await.is_empty());
    // controls were already handed back when start failed
    assert_eq!(fixture.rig.controls.enable_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_uncalibrated_focus_aborts_start() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    fixture.rig.focus.set_calibrated(false);
    let mut task = fixture.task();

    let state = run_task(&mut task).await;
    assert_eq!(state, TaskState::Terminated);
    assert!(task.was_aborted());
    assert_eq!(task.cycles_run(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_rejected() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let mut task = fixture.task();

    task.start().await.unwrap();
    assert!(task.start().await.is_err());
    assert_eq!(task.state(), TaskState::Running);
    task.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_focus_losses_abort_run() {
    let fixture = RunFixture::new(&[(1, "RT1"), (2, "RT2")], HYBRIDIZATION);
    fixture.rig.focus.script_outcomes([false, false]).await;
    let alert = Arc::new(RecordingAlert::default());
    let mut task = fixture.task_with(fixture.services_with_alert(alert.clone()));

    task.start().await.unwrap();
    assert!(!task.step().await);
    assert_eq!(task.state(), TaskState::Aborted);

    task.cleanup().await;
    assert!(task.was_aborted());
    assert_eq!(task.cycles_run(), 1);
    assert_eq!(alert.0.lock().unwrap().len(), 1);
    // the second probe never reached the needle
    assert_eq!(fixture.rig.needle.moves().await, vec![1]);

    let events = std::fs::read_to_string(
        task.run_directory().unwrap().metadata_file(EVENTS_FILE),
    )
    .unwrap();
    assert!(events.contains("Task was aborted"));
}

#[tokio::test(start_paused = true)]
async fn test_external_abort_between_cycles() {
    let fixture = RunFixture::new(&[(1, "RT1"), (2, "RT2")], HYBRIDIZATION);
    let mut task = fixture.task();

    task.start().await.unwrap();
    assert!(task.step().await);
    task.abort_flag().request();
    assert!(!task.step().await);
    assert_eq!(task.state(), TaskState::Aborted);
    assert_eq!(task.cycles_run(), 1);
    task.cleanup().await;
    assert!(task.was_aborted());
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_incubation_stops_promptly() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let mut task = fixture.task();
    task.start().await.unwrap();

    let abort = task.abort_flag();
    // needle travel plus the 60 s injection puts the run inside the incubation
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(80)).await;
        abort.request();
    });

    let started = Instant::now();
    assert!(!task.step().await);
    assert!(started.elapsed() < Duration::from_secs(120));
    assert_eq!(task.state(), TaskState::Aborted);
    // no imaging after an abort in hybridization
    assert!(fixture.rig.camera.saved().await.is_empty());
    // fluidics left safe
    assert_eq!(fixture.rig.flow.pressure().await, 0.0);
    assert!(!fixture.rig.flow.is_regulating().await);
    assert_eq!(fixture.rig.valves.position(ValveBank::Buffer).await, Some(1));
    assert_eq!(fixture.rig.valves.position(ValveBank::Needle).await, Some(1));
    task.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_until_resumed() {
    let fixture = RunFixture::new(&[(1, "RT1"), (2, "RT2")], HYBRIDIZATION);
    let mut task = fixture.task();
    task.start().await.unwrap();

    assert!(task.step().await);
    task.pause().await;
    assert_eq!(task.state(), TaskState::Pausing);
    assert!(task.step().await);
    assert!(task.step().await);
    assert_eq!(task.cycles_run(), 1);

    task.resume().await;
    assert_eq!(task.state(), TaskState::Resuming);
    assert!(!task.step().await);
    assert_eq!(task.state(), TaskState::Running);
    assert_eq!(task.cycles_run(), 2);
    task.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_needle_advances_on_repeated_probe_injections() {
    let fixture = RunFixture::new(&[(5, "RT5")], TRIPLE_NEEDLE_HYBRIDIZATION);
    let mut task = fixture.task();

    let state = run_task(&mut task).await;
    assert_eq!(state, TaskState::Terminated);
    assert!(!task.was_aborted());
    assert_eq!(fixture.rig.needle.moves().await, vec![5, 6, 7]);
}

#[tokio::test(start_paused = true)]
async fn test_network_down_at_start_disables_transfer() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let network = fixture.dir.path().join("network");
    let fixture = fixture.with_config(&format!(
        "[transfer]\nenabled = true\nnetwork_path = '{}'\n",
        network.display()
    ));
    let services = TaskServices {
        network: Arc::new(FixedNetwork(false)),
        ..TaskServices::from_config(&fixture.config.transfer)
    };
    let mut task = fixture.task_with(services);

    let state = run_task(&mut task).await;
    assert_eq!(state, TaskState::Terminated);
    assert!(!task.was_aborted());
    assert!(!network.exists());

    let events = std::fs::read_to_string(
        task.run_directory().unwrap().metadata_file(EVENTS_FILE),
    )
    .unwrap();
    assert!(events.contains("transfer disabled"));
}

#[tokio::test(start_paused = true)]
async fn test_run_directory_mirrored_on_network() {
    let fixture = RunFixture::new(&[(1, "RT1")], HYBRIDIZATION);
    let network = fixture.dir.path().join("network");
    let fixture = fixture.with_config(&format!(
        "[transfer]\nenabled = true\nnetwork_path = '{}'\n",
        network.display()
    ));
    let services = TaskServices {
        network: Arc::new(FixedNetwork(true)),
        ..TaskServices::from_config(&fixture.config.transfer)
    };
    let mut task = fixture.task_with(services);

    let state = run_task(&mut task).await;
    assert_eq!(state, TaskState::Terminated);
    assert!(!task.was_aborted());

    let mirrored = network.join(task.run_directory().unwrap().name());
    assert!(mirrored.join("ROI_001").join("scan_001_RT1_001_ROI.tif").exists());
    assert!(mirrored.join("ROI_002").join("scan_001_RT1_002_ROI.yaml").exists());
    assert!(mirrored.join("metadata").join(PARAMETERS_FILE).exists());
}

#[tokio::test(start_paused = true)]
async fn test_final_records_reach_network() {
    let fixture = RunFixture::new(&[(1, "RT1"), (2, "RT2")], HYBRIDIZATION);
    let network = fixture.dir.path().join("network");
    let fixture = fixture.with_config(&format!(
        "[transfer]\nenabled = true\nnetwork_path = '{}'\n",
        network.display()
    ));
    let services = TaskServices {
        network: Arc::new(FixedNetwork(true)),
        ..TaskServices::from_config(&fixture.config.transfer)
    };
    let mut task = fixture.task_with(services);
    assert_eq!(run_task(&mut task).await, TaskState::Terminated);

    let directory = task.run_directory().unwrap();
    let mirrored = network.join(directory.name()).join("metadata");
    for file in [EVENTS_FILE, STATUS_FILE] {
        let local = std::fs::read_to_string(directory.metadata_file(file)).unwrap();
        let remote = std::fs::read_to_string(mirrored.join(file)).unwrap();
        assert_eq!(remote, local, "{file} differs on the network");
    }
    let events = std::fs::read_to_string(mirrored.join(EVENTS_FILE)).unwrap();
    assert!(events.contains("Task finished"));
}
